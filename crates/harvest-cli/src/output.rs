use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use harvest_core::{FieldMap, Handler, LoopControl, Page};

/// One line of `collect` output.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Record<'a> {
    Fields {
        page_id: &'a str,
        url: &'a str,
        rule: Option<&'a str>,
        fields: BTreeMap<&'a str, &'a str>,
        at: DateTime<Utc>,
    },
    Loop {
        page_id: &'a str,
        url: &'a str,
        index: usize,
        batch: &'a [String],
        at: DateTime<Utc>,
    },
    Complete {
        page_id: &'a str,
        url: &'a str,
        at: DateTime<Utc>,
    },
}

/// Handler that writes every callback as a JSON line.
pub struct JsonLinesHandler<W> {
    out: Mutex<W>,
}

impl JsonLinesHandler<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> JsonLinesHandler<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, record: &Record<'_>) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        let written = serde_json::to_writer(&mut *out, record)
            .map_err(std::io::Error::from)
            .and_then(|()| out.write_all(b"\n"))
            .and_then(|()| out.flush());
        if let Err(e) = written {
            tracing::error!(error = %e, "Failed to write output record");
        }
    }
}

impl<W: Write + Send> Handler for JsonLinesHandler<W> {
    fn on_fields(&self, page: &Page, fields: &FieldMap) {
        self.emit(&Record::Fields {
            page_id: page.id(),
            url: page.url(),
            rule: page.rule().map(|r| r.id.as_str()),
            fields: fields
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
            at: Utc::now(),
        });
    }

    fn on_loop(&self, page: &Page, index: usize, batch: &[String]) -> LoopControl {
        self.emit(&Record::Loop {
            page_id: page.id(),
            url: page.url(),
            index,
            batch,
            at: Utc::now(),
        });
        LoopControl::Continue
    }

    fn on_complete(&self, page: &Page) {
        self.emit(&Record::Complete {
            page_id: page.id(),
            url: page.url(),
            at: Utc::now(),
        });
    }
}
