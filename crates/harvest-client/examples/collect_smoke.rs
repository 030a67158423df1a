/// Smoke-test for `ChromeBrowser`.
///
/// Launches a headless Chromium, collects <https://example.com> with an
/// inline rule, and verifies the heading field and the loop batches.
///
/// Run with:
///   cargo run -p harvest-client --example collect_smoke
use std::sync::{Arc, Mutex};

use harvest_client::ChromeBrowser;
use harvest_core::{FieldMap, Handler, LoopControl, Page, RuleStore, SessionState};

const RULE: &str = r#"
id: example-domain
group: smoke
patterns:
  - '^https://example\.com/?$'
timeout: 15s
fields:
  - name: heading
    eval: "document.querySelector('h1').textContent"
  - name: shout
    eval: "field_heading.toUpperCase()"
loop:
  name: ticks
  export_cycle: 2
  eval: "'tick-' + loop_count"
  next: "loop_count < 3"
"#;

#[derive(Default)]
struct Collected {
    fields: Mutex<FieldMap>,
    batches: Mutex<Vec<Vec<String>>>,
}

impl Handler for Collected {
    fn on_fields(&self, _page: &Page, fields: &FieldMap) {
        *self.fields.lock().unwrap() = fields.clone();
    }

    fn on_loop(&self, _page: &Page, _index: usize, batch: &[String]) -> LoopControl {
        self.batches.lock().unwrap().push(batch.to_vec());
        LoopControl::Continue
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let store = RuleStore::new();
    store.append(RULE.as_bytes())?;

    println!("Launching headless browser…");
    let browser = ChromeBrowser::launch().await?;

    let handler = Arc::new(Collected::default());
    let session = Page::new("smoke-1", "https://example.com/", "smoke")?
        .collect(&browser, &store, handler.clone())
        .await?;
    let state = session.wait().await;
    session.close().await?;

    assert_eq!(state, SessionState::Completed);
    let fields = handler.fields.lock().unwrap().clone();
    assert_eq!(fields["heading"], "Example Domain");
    assert_eq!(fields["shout"], "EXAMPLE DOMAIN");
    let batches = handler.batches.lock().unwrap().clone();
    assert_eq!(batches, [vec!["tick-1", "tick-2"], vec!["tick-3"]]);

    println!("OK, fields: {fields:?}, batches: {batches:?}");
    Ok(())
}
