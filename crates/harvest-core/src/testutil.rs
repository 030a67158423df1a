//! Test utilities: mock implementations of the browser and handler traits.
//!
//! Handwritten mocks for dependency injection in unit and integration tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing test
//! assertions on recorded calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use crate::error::HarvestError;
use crate::page::Page;
use crate::traits::{
    Browser, EventSink, FieldMap, Handler, LOAD_EVENT_FIRED, LoopControl, PendingResponse, Tab,
    TabEvent,
};

/// Names published into the mock page (`const x=…;`, `let x=…;`, `x=…;`).
pub type Globals = HashMap<String, String>;

type Responder = Arc<dyn Fn(&str, &Globals) -> Value + Send + Sync>;

/// Wrap a string as a `Runtime.evaluate` response.
pub fn string_result(value: &str) -> Value {
    json!({"result": {"type": "string", "value": value}})
}

/// Wrap a boolean as a `Runtime.evaluate` response.
pub fn bool_result(value: bool) -> Value {
    json!({"result": {"type": "boolean", "value": value}})
}

/// Minimal rule file with a single pattern.
pub fn rule_yaml(id: &str, version: i64, group: &str, priority: i64, pattern: &str) -> String {
    format!(
        "id: \"{id}\"\nversion: {version}\ngroup: \"{group}\"\npriority: {priority}\npatterns:\n  - '{pattern}'\n"
    )
}

// ---------------------------------------------------------------------------
// MockTab
// ---------------------------------------------------------------------------

/// A command the mock tab received.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: String,
    pub params: Value,
}

#[derive(Default)]
struct TabState {
    calls: Vec<RecordedCall>,
    globals: Globals,
    subscriptions: Vec<String>,
    fired: Vec<TabEvent>,
    closed: bool,
    fail_evaluate: bool,
    fail_navigate: bool,
    load_on_navigate: bool,
    navigate_delay: Option<Duration>,
}

/// Mock tab that answers `Runtime.evaluate` through a responder closure.
///
/// Assignment expressions are applied to an in-memory global table instead
/// of reaching the responder, so scripts can observe earlier results.
#[derive(Clone)]
pub struct MockTab {
    id: String,
    responder: Responder,
    sink: Option<EventSink>,
    next_id: Arc<AtomicUsize>,
    state: Arc<Mutex<TabState>>,
}

impl MockTab {
    /// Standalone tab with no event sink.
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str, &Globals) -> Value + Send + Sync + 'static,
    {
        Self::build("tab-0".into(), Arc::new(responder), None)
    }

    fn build(id: String, responder: Responder, sink: Option<EventSink>) -> Self {
        Self {
            id,
            responder,
            sink,
            next_id: Arc::new(AtomicUsize::new(1)),
            state: Arc::new(Mutex::new(TabState::default())),
        }
    }

    /// Make every `Runtime.evaluate` fail at the transport level.
    pub fn fail_evaluate(&self) {
        self.state.lock().unwrap().fail_evaluate = true;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Expressions passed to `Runtime.evaluate`, in order.
    pub fn expressions(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.method == "Runtime.evaluate")
            .filter_map(|c| c.params["expression"].as_str().map(str::to_string))
            .collect()
    }

    pub fn methods(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.method).collect()
    }

    pub fn global(&self, name: &str) -> Option<String> {
        self.state.lock().unwrap().globals.get(name).cloned()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().unwrap().subscriptions.clone()
    }

    pub fn fired(&self) -> Vec<TabEvent> {
        self.state.lock().unwrap().fired.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn evaluate(&self, expression: &str) -> Value {
        let globals = {
            let mut state = self.state.lock().unwrap();
            if let Some((name, value)) = parse_assignment(expression) {
                state.globals.insert(name, value);
                return json!({"result": {"type": "undefined"}});
            }
            state.globals.clone()
        };
        (self.responder)(expression, &globals)
    }
}

/// Parse `const name=<json>;`, `let name=<json>;` or `name=<json>;`.
fn parse_assignment(expression: &str) -> Option<(String, String)> {
    let body = expression.strip_suffix(';')?;
    let body = body
        .strip_prefix("const ")
        .or_else(|| body.strip_prefix("let "))
        .unwrap_or(body);
    let (name, value) = body.split_once('=')?;
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    let value = match serde_json::from_str::<Value>(value).ok()? {
        Value::String(s) => s,
        other => other.to_string(),
    };
    Some((name.to_string(), value))
}

impl Tab for MockTab {
    fn id(&self) -> &str {
        &self.id
    }

    async fn subscribe(&self, event: &str) -> Result<(), HarvestError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(HarvestError::Transport("tab closed".into()));
        }
        state.subscriptions.push(event.to_string());
        Ok(())
    }

    async fn call(&self, method: &str, params: Value) -> Result<PendingResponse, HarvestError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as u64;
        let (fail_evaluate, fail_navigate, load_on_navigate, navigate_delay) = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(HarvestError::Transport("tab closed".into()));
            }
            state.calls.push(RecordedCall {
                method: method.to_string(),
                params: params.clone(),
            });
            let subscribed = state.subscriptions.iter().any(|s| s == LOAD_EVENT_FIRED);
            (
                state.fail_evaluate,
                state.fail_navigate,
                state.load_on_navigate && subscribed,
                state.navigate_delay,
            )
        };

        match method {
            "Runtime.evaluate" => {
                if fail_evaluate {
                    return Err(HarvestError::Transport("evaluate refused".into()));
                }
                let expression = params["expression"].as_str().unwrap_or_default();
                Ok(PendingResponse::ready(id, Ok(self.evaluate(expression))))
            }
            "Page.navigate" => {
                if fail_navigate {
                    return Ok(PendingResponse::ready(
                        id,
                        Ok(json!({"frameId": "main", "errorText": "net::ERR_NAME_NOT_RESOLVED"})),
                    ));
                }
                let sink = self.sink.clone().filter(|_| load_on_navigate);
                let Some(delay) = navigate_delay else {
                    if let Some(sink) = sink {
                        let _ = sink.send(TabEvent::load_fired());
                    }
                    return Ok(PendingResponse::ready(id, Ok(json!({"frameId": "main"}))));
                };
                // Answer only after the page has loaded, like a browser that
                // resolves navigation on the load event.
                let (pending, tx) = PendingResponse::channel(id);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(sink) = sink {
                        let _ = sink.send(TabEvent::load_fired());
                    }
                    let _ = tx.send(Ok(json!({"frameId": "main"})));
                });
                Ok(pending)
            }
            _ => Ok(PendingResponse::ready(id, Ok(json!({})))),
        }
    }

    fn fire(&self, event: TabEvent) -> Result<(), HarvestError> {
        self.state.lock().unwrap().fired.push(event.clone());
        let sink = self
            .sink
            .as_ref()
            .ok_or_else(|| HarvestError::Transport("tab has no event sink".into()))?;
        sink.send(event)
            .map_err(|_| HarvestError::Transport("event sink closed".into()))
    }

    async fn close(&self) -> Result<(), HarvestError> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockBrowser
// ---------------------------------------------------------------------------

struct BrowserState {
    tabs: Vec<MockTab>,
    fail_new_tab: bool,
    fail_navigate: bool,
    load_on_navigate: bool,
    navigate_delay: Option<Duration>,
}

/// Mock browser handing out [`MockTab`]s that share one responder.
///
/// By default a tab delivers `Page.loadEventFired` as soon as it navigates.
#[derive(Clone)]
pub struct MockBrowser {
    responder: Responder,
    state: Arc<Mutex<BrowserState>>,
}

impl MockBrowser {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str, &Globals) -> Value + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            state: Arc::new(Mutex::new(BrowserState {
                tabs: Vec::new(),
                fail_new_tab: false,
                fail_navigate: false,
                load_on_navigate: true,
                navigate_delay: None,
            })),
        }
    }

    /// Tabs never fire a real load event; only the timeout fallback does.
    pub fn without_load_event(self) -> Self {
        self.state.lock().unwrap().load_on_navigate = false;
        self
    }

    /// `Page.navigate` is answered only after `delay`.
    pub fn delayed_navigate(self, delay: Duration) -> Self {
        self.state.lock().unwrap().navigate_delay = Some(delay);
        self
    }

    pub fn failing_new_tab(self) -> Self {
        self.state.lock().unwrap().fail_new_tab = true;
        self
    }

    pub fn failing_navigate(self) -> Self {
        self.state.lock().unwrap().fail_navigate = true;
        self
    }

    pub fn tabs(&self) -> Vec<MockTab> {
        self.state.lock().unwrap().tabs.clone()
    }
}

impl Browser for MockBrowser {
    type Tab = MockTab;

    async fn new_tab(&self, sink: EventSink) -> Result<MockTab, HarvestError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_new_tab {
            return Err(HarvestError::Transport("browser refused new tab".into()));
        }
        let tab = MockTab::build(
            format!("tab-{}", state.tabs.len() + 1),
            Arc::clone(&self.responder),
            Some(sink),
        );
        {
            let mut tab_state = tab.state.lock().unwrap();
            tab_state.fail_navigate = state.fail_navigate;
            tab_state.load_on_navigate = state.load_on_navigate;
            tab_state.navigate_delay = state.navigate_delay;
        }
        state.tabs.push(tab.clone());
        Ok(tab)
    }
}

// ---------------------------------------------------------------------------
// RecordingHandler
// ---------------------------------------------------------------------------

/// A callback the recording handler received.
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Fields(FieldMap),
    Loop { index: usize, batch: Vec<String> },
    Complete,
}

/// Handler that records callbacks, optionally stopping the loop after
/// a number of batches.
#[derive(Default, Clone)]
pub struct RecordingHandler {
    pub events: Arc<Mutex<Vec<Recorded>>>,
    stop_after: Option<usize>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return [`LoopControl::Stop`] from the `n`th batch on.
    pub fn stop_after_batches(n: usize) -> Self {
        Self {
            events: Arc::default(),
            stop_after: Some(n),
        }
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn fields(&self) -> Vec<FieldMap> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Fields(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    /// `(index, batch)` of every loop callback.
    pub fn batches(&self) -> Vec<(usize, Vec<String>)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Loop { index, batch } => Some((index, batch)),
                _ => None,
            })
            .collect()
    }

    pub fn completions(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Recorded::Complete))
            .count()
    }
}

impl Handler for RecordingHandler {
    fn on_fields(&self, _page: &Page, fields: &FieldMap) {
        self.events
            .lock()
            .unwrap()
            .push(Recorded::Fields(fields.clone()));
    }

    fn on_loop(&self, _page: &Page, index: usize, batch: &[String]) -> LoopControl {
        let mut events = self.events.lock().unwrap();
        events.push(Recorded::Loop {
            index,
            batch: batch.to_vec(),
        });
        let batches = events
            .iter()
            .filter(|e| matches!(e, Recorded::Loop { .. }))
            .count();
        match self.stop_after {
            Some(n) if batches >= n => LoopControl::Stop,
            _ => LoopControl::Continue,
        }
    }

    fn on_complete(&self, _page: &Page) {
        self.events.lock().unwrap().push(Recorded::Complete);
    }
}
