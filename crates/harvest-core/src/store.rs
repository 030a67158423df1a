//! Group-scoped, priority-ordered rule registry.
//!
//! Every group keeps its rules sorted ascending by `priority` (stable, so
//! equal priorities keep insertion order). Lookups take a shared read lock;
//! installs and removals hold the write lock for the whole update, so a
//! reader sees either the old list or the new one.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::HarvestError;
use crate::rule::Rule;
use crate::util::{decode_html_entities, is_rule_file};

/// What happened to a rule handed to [`RuleGroup::install`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// No rule with this id existed.
    Added { id: String, version: i64 },
    /// A rule with the same id and an older or equal version was replaced.
    Replaced {
        id: String,
        previous: i64,
        version: i64,
    },
    /// The stored rule is newer; the incoming one was discarded.
    Ignored {
        id: String,
        stored: i64,
        version: i64,
    },
}

/// The ordered rules of a single group.
#[derive(Debug)]
pub struct RuleGroup {
    name: String,
    rules: RwLock<Vec<Arc<Rule>>>,
}

impl RuleGroup {
    pub fn new(name: impl Into<String>) -> Result<Self, HarvestError> {
        let name = name.into();
        if name.is_empty() {
            return Err(HarvestError::InvalidArgument("group name is empty".into()));
        }
        Ok(Self {
            name,
            rules: RwLock::new(Vec::with_capacity(16)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parse a YAML rule and install it into this group.
    pub fn append(&self, bytes: &[u8]) -> Result<InstallOutcome, HarvestError> {
        self.install(Rule::from_yaml(bytes)?)
    }

    /// Install a compiled rule.
    ///
    /// A rule with a known id replaces the stored one when its version is
    /// greater than or equal to the stored version.
    pub fn install(&self, rule: Rule) -> Result<InstallOutcome, HarvestError> {
        if rule.group != self.name {
            return Err(HarvestError::GroupMismatch {
                id: rule.id,
                expected: self.name.clone(),
                found: rule.group,
            });
        }

        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let outcome = match rules.iter().position(|r| r.id == rule.id) {
            None => {
                let outcome = InstallOutcome::Added {
                    id: rule.id.clone(),
                    version: rule.version,
                };
                rules.push(Arc::new(rule));
                outcome
            }
            Some(i) if rules[i].version <= rule.version => {
                let outcome = InstallOutcome::Replaced {
                    id: rule.id.clone(),
                    previous: rules[i].version,
                    version: rule.version,
                };
                rules[i] = Arc::new(rule);
                outcome
            }
            Some(i) => InstallOutcome::Ignored {
                id: rule.id,
                stored: rules[i].version,
                version: rule.version,
            },
        };
        rules.sort_by_key(|r| r.priority);
        drop(rules);

        match &outcome {
            InstallOutcome::Added { id, version } => {
                tracing::info!(group = %self.name, %id, %version, "Rule added");
            }
            InstallOutcome::Replaced {
                id,
                previous,
                version,
            } => {
                tracing::info!(group = %self.name, %id, %previous, %version, "Rule replaced");
            }
            InstallOutcome::Ignored {
                id,
                stored,
                version,
            } => {
                tracing::warn!(group = %self.name, %id, %stored, %version, "Ignoring older rule version");
            }
        }
        Ok(outcome)
    }

    /// Remove rules by id. Unknown ids are skipped; returns how many were removed.
    pub fn remove(&self, ids: &[&str]) -> Result<usize, HarvestError> {
        if ids.is_empty() || ids.iter().any(|id| id.is_empty()) {
            return Err(HarvestError::InvalidArgument("rule id is empty".into()));
        }
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let before = rules.len();
        rules.retain(|r| !ids.contains(&r.id.as_str()));
        let removed = before - rules.len();
        drop(rules);

        tracing::info!(group = %self.name, ?ids, %removed, "Rules removed");
        Ok(removed)
    }

    /// Find the first rule, in priority order, with a pattern matching `url`.
    ///
    /// HTML character references in the URL are decoded first.
    pub fn match_url(&self, url: &str) -> Option<Arc<Rule>> {
        if url.is_empty() {
            return None;
        }
        let url = decode_html_entities(url);
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        rules.iter().find(|r| r.matches(&url)).cloned()
    }

    /// Snapshot of the rules in match order.
    pub fn rules(&self) -> Vec<Arc<Rule>> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.rules.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of loading a single rule file.
#[derive(Debug)]
pub struct LoadResult {
    pub path: PathBuf,
    pub status: LoadStatus,
}

/// Status of a single file load attempt.
#[derive(Debug)]
pub enum LoadStatus {
    Loaded(InstallOutcome),
    /// Parse or validation error occurred; nothing was installed.
    Failed { error: String },
}

/// All rule groups known to the process.
///
/// Created once at startup and shared by reference (or `Arc`) with every
/// page session.
#[derive(Debug, Default)]
pub struct RuleStore {
    groups: RwLock<HashMap<String, Arc<RuleGroup>>>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a YAML rule and install it into the group it declares.
    pub fn append(&self, bytes: &[u8]) -> Result<InstallOutcome, HarvestError> {
        let rule = Rule::from_yaml(bytes)?;
        self.group_or_insert(&rule.group)?.install(rule)
    }

    /// Parse a YAML rule and install it into `group`, rejecting rules that
    /// declare a different group.
    pub fn append_to(&self, group: &str, bytes: &[u8]) -> Result<InstallOutcome, HarvestError> {
        if group.is_empty() {
            return Err(HarvestError::InvalidArgument("group name is empty".into()));
        }
        let rule = Rule::from_yaml(bytes)?;
        if rule.group != group {
            return Err(HarvestError::GroupMismatch {
                id: rule.id,
                expected: group.to_string(),
                found: rule.group,
            });
        }
        self.group_or_insert(group)?.install(rule)
    }

    /// Read a rule file and install it.
    pub fn append_file(&self, path: &Path) -> Result<InstallOutcome, HarvestError> {
        let bytes = fs::read(path)?;
        self.append(&bytes)
    }

    /// Install every `*.yml` / `*.yaml` file directly inside `dir`.
    ///
    /// Files are visited in name order. A file that fails to parse is
    /// reported and skipped; it does not abort the scan.
    pub fn load_dir(&self, dir: &Path) -> Result<Vec<LoadResult>, HarvestError> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && is_rule_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let results = paths
            .into_iter()
            .map(|path| {
                let status = match self.append_file(&path) {
                    Ok(outcome) => LoadStatus::Loaded(outcome),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to load rule file");
                        LoadStatus::Failed {
                            error: e.to_string(),
                        }
                    }
                };
                LoadResult { path, status }
            })
            .collect();
        Ok(results)
    }

    /// Remove rules by id from a group.
    pub fn remove(&self, group: &str, ids: &[&str]) -> Result<usize, HarvestError> {
        if group.is_empty() {
            return Err(HarvestError::InvalidArgument("group name is empty".into()));
        }
        match self.group(group) {
            Some(g) => g.remove(ids),
            None => {
                if ids.is_empty() || ids.iter().any(|id| id.is_empty()) {
                    return Err(HarvestError::InvalidArgument("rule id is empty".into()));
                }
                Ok(0)
            }
        }
    }

    /// Find the rule that applies to `url` within `group`.
    pub fn match_url(&self, group: &str, url: &str) -> Option<Arc<Rule>> {
        self.group(group)?.match_url(url)
    }

    pub fn group(&self, name: &str) -> Option<Arc<RuleGroup>> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Names of all known groups, sorted.
    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Snapshot of a group's rules in match order; empty for unknown groups.
    pub fn rules(&self, group: &str) -> Vec<Arc<Rule>> {
        self.group(group).map(|g| g.rules()).unwrap_or_default()
    }

    fn group_or_insert(&self, name: &str) -> Result<Arc<RuleGroup>, HarvestError> {
        if let Some(g) = self.group(name) {
            return Ok(g);
        }
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(g) = groups.get(name) {
            return Ok(Arc::clone(g));
        }
        let g = Arc::new(RuleGroup::new(name)?);
        groups.insert(name.to_string(), Arc::clone(&g));
        Ok(g)
    }
}
