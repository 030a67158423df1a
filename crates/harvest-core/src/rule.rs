//! Rule definitions: the YAML schema, compiled URL patterns and derived durations.
//!
//! A rule file is parsed into a private `*Def` mirror of the schema, then
//! compiled into an immutable [`Rule`]. Compilation is where patterns become
//! regexes and duration strings become [`Duration`]s; the store only ever
//! holds compiled rules.

use std::collections::HashSet;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::error::HarvestError;

/// How long a page waits for `Page.loadEventFired` before the fallback fires.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Loop iterations per exported batch when a rule does not say otherwise.
pub const DEFAULT_EXPORT_CYCLE: usize = 10;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RuleDef {
    id: String,
    version: i64,
    name: String,
    alias: String,
    group: String,
    priority: i64,
    patterns: Vec<String>,
    timeout: String,
    prepare: Option<PrepareDef>,
    fields: Vec<FieldDef>,
    #[serde(rename = "loop")]
    looping: Option<LoopDef>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PrepareDef {
    eval: String,
    wait: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FieldDef {
    name: String,
    alias: String,
    value: String,
    eval: String,
    export: bool,
    wait: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoopDef {
    name: String,
    alias: String,
    export_cycle: usize,
    prepare: Option<PrepareDef>,
    eval: String,
    next: String,
    wait: String,
}

// ---------------------------------------------------------------------------
// Compiled rule
// ---------------------------------------------------------------------------

/// A compiled URL pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    /// Compile a pattern, returning `None` if the regex is invalid.
    pub fn compile(source: &str) -> Option<Self> {
        match Regex::new(source) {
            Ok(regex) => Some(Self {
                source: source.to_string(),
                regex,
            }),
            Err(e) => {
                tracing::warn!(pattern = %source, error = %e, "Dropping invalid URL pattern");
                None
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }
}

/// A gate script run before the fields or the loop.
#[derive(Debug, Clone)]
pub struct Prepare {
    pub eval: String,
    pub wait: Duration,
}

/// A single named extraction.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub alias: String,
    /// Static value; injected as `field_value` when `eval` is also set.
    pub value: String,
    pub eval: String,
    /// Carried for consumers, ignored by the engine.
    pub export: bool,
    pub wait: Duration,
}

/// Repeating extraction for pagination or polling.
#[derive(Debug, Clone)]
pub struct Loop {
    pub name: String,
    pub alias: String,
    pub export_cycle: usize,
    pub prepare: Option<Prepare>,
    pub eval: String,
    pub next: String,
    pub wait: Duration,
}

/// An installed extraction rule. Immutable once compiled.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub version: i64,
    pub name: String,
    pub alias: String,
    pub group: String,
    pub priority: i64,
    pub patterns: Vec<Pattern>,
    pub timeout: Duration,
    pub prepare: Option<Prepare>,
    pub fields: Vec<Field>,
    pub looping: Option<Loop>,
}

impl Rule {
    /// Parse and compile a single YAML rule definition.
    pub fn from_yaml(bytes: &[u8]) -> Result<Self, HarvestError> {
        if bytes.is_empty() {
            return Err(HarvestError::InvalidArgument("rule bytes are empty".into()));
        }
        let def: RuleDef = serde_yaml::from_slice(bytes)?;
        Self::compile(def)
    }

    fn compile(def: RuleDef) -> Result<Self, HarvestError> {
        if def.id.is_empty() {
            return Err(HarvestError::InvalidRule("rule id must not be empty".into()));
        }
        if def.group.is_empty() {
            return Err(HarvestError::InvalidRule(format!(
                "rule '{}' has no group",
                def.id
            )));
        }

        let patterns = def
            .patterns
            .iter()
            .filter_map(|p| Pattern::compile(p))
            .collect();

        let mut seen = HashSet::new();
        let mut fields = Vec::with_capacity(def.fields.len());
        for f in def.fields {
            if f.name.is_empty() {
                return Err(HarvestError::InvalidRule(format!(
                    "rule '{}' has a field without a name",
                    def.id
                )));
            }
            if !is_identifier_part(&f.name) {
                return Err(HarvestError::InvalidRule(format!(
                    "rule '{}' field '{}' cannot be used in a script name",
                    def.id, f.name
                )));
            }
            if !seen.insert(f.name.clone()) {
                return Err(HarvestError::InvalidRule(format!(
                    "rule '{}' declares field '{}' twice",
                    def.id, f.name
                )));
            }
            fields.push(Field {
                wait: optional_duration(&f.wait, Duration::ZERO)?,
                name: f.name,
                alias: f.alias,
                value: f.value,
                eval: f.eval,
                export: f.export,
            });
        }

        let looping = match def.looping {
            Some(l) => Some(Loop {
                name: l.name,
                alias: l.alias,
                export_cycle: if l.export_cycle == 0 {
                    DEFAULT_EXPORT_CYCLE
                } else {
                    l.export_cycle
                },
                prepare: l.prepare.map(compile_prepare).transpose()?,
                eval: l.eval,
                next: l.next,
                wait: optional_duration(&l.wait, Duration::ZERO)?,
            }),
            None => None,
        };

        Ok(Self {
            timeout: optional_duration(&def.timeout, DEFAULT_TIMEOUT)?,
            prepare: def.prepare.map(compile_prepare).transpose()?,
            id: def.id,
            version: def.version,
            name: def.name,
            alias: def.alias,
            group: def.group,
            priority: def.priority,
            patterns,
            fields,
            looping,
        })
    }

    /// Returns true if any compiled pattern matches the URL.
    pub fn matches(&self, url: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(url))
    }
}

/// Field results are published as `field_<name>`, so the name must be usable
/// inside a script identifier.
fn is_identifier_part(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

fn compile_prepare(def: PrepareDef) -> Result<Prepare, HarvestError> {
    Ok(Prepare {
        wait: optional_duration(&def.wait, Duration::ZERO)?,
        eval: def.eval,
    })
}

fn optional_duration(text: &str, default: Duration) -> Result<Duration, HarvestError> {
    if text.trim().is_empty() {
        Ok(default)
    } else {
        parse_duration(text)
    }
}

/// Parse a duration such as `"10s"`, `"1m30s"`, `"500ms"` or `"1.5h"`.
pub fn parse_duration(text: &str) -> Result<Duration, HarvestError> {
    ::parse_duration::parse(text.trim())
        .map_err(|e| HarvestError::InvalidRule(format!("invalid duration '{text}': {e}")))
}
