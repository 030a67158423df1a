use std::collections::HashMap;
use std::future::Future;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::HarvestError;
use crate::page::Page;

/// CDP event fired when the page's `load` event has run.
pub const LOAD_EVENT_FIRED: &str = "Page.loadEventFired";

/// Field name → extracted value, as delivered to [`Handler::on_fields`].
pub type FieldMap = HashMap<String, String>;

/// Where a tab delivers the events it was subscribed to.
pub type EventSink = mpsc::UnboundedSender<TabEvent>;

/// An event delivered by a tab, real or synthesized.
#[derive(Debug, Clone, PartialEq)]
pub struct TabEvent {
    pub method: String,
    pub params: Value,
    /// True when the event was produced by [`Tab::fire`] rather than the browser.
    pub synthetic: bool,
}

impl TabEvent {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            synthetic: false,
        }
    }

    pub fn load_fired() -> Self {
        Self::new(LOAD_EVENT_FIRED, Value::Null)
    }

    pub fn into_synthetic(mut self) -> Self {
        self.synthetic = true;
        self
    }

    pub fn is_load_fired(&self) -> bool {
        self.method == LOAD_EVENT_FIRED
    }
}

/// Acknowledgement of an issued command plus its eventual response.
#[derive(Debug)]
pub struct PendingResponse {
    /// Command id assigned by the tab.
    pub id: u64,
    rx: oneshot::Receiver<Result<Value, HarvestError>>,
}

impl PendingResponse {
    /// Create a pending response and the sender that completes it.
    pub fn channel(id: u64) -> (Self, oneshot::Sender<Result<Value, HarvestError>>) {
        let (tx, rx) = oneshot::channel();
        (Self { id, rx }, tx)
    }

    /// A response that is already known.
    pub fn ready(id: u64, result: Result<Value, HarvestError>) -> Self {
        let (pending, tx) = Self::channel(id);
        let _ = tx.send(result);
        pending
    }

    /// Wait for the command's response.
    pub async fn response(self) -> Result<Value, HarvestError> {
        self.rx.await.map_err(|_| {
            HarvestError::Transport(format!("command {} dropped without a response", self.id))
        })?
    }
}

/// Opens tabs on a remotely controlled browser.
pub trait Browser: Send + Sync + Clone + 'static {
    type Tab: Tab;

    /// Open a new tab whose subscribed events are delivered to `sink`.
    fn new_tab(&self, sink: EventSink) -> impl Future<Output = Result<Self::Tab, HarvestError>> + Send;
}

/// The command surface of a single browser tab.
pub trait Tab: Send + Sync + Clone + 'static {
    fn id(&self) -> &str;

    /// Start delivering events named `event` to the tab's sink.
    fn subscribe(&self, event: &str) -> impl Future<Output = Result<(), HarvestError>> + Send;

    /// Issue a protocol command. Returns once the command is sent; the
    /// response arrives through the returned [`PendingResponse`].
    fn call(
        &self,
        method: &str,
        params: Value,
    ) -> impl Future<Output = Result<PendingResponse, HarvestError>> + Send;

    /// Deliver a synthetic event to the tab's sink.
    fn fire(&self, event: TabEvent) -> Result<(), HarvestError>;

    fn close(&self) -> impl Future<Output = Result<(), HarvestError>> + Send;
}

/// Whether the loop should keep iterating after a batch was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Stop,
}

/// Receives the results of a page collection.
///
/// `on_fields` and `on_complete` are called exactly once per page; `on_loop`
/// once per full export batch and at most once more with a trailing partial
/// batch.
pub trait Handler: Send + Sync {
    fn on_fields(&self, page: &Page, fields: &FieldMap) {
        let _ = (page, fields);
    }

    /// `index` is the 1-based iteration that completed the batch.
    fn on_loop(&self, page: &Page, index: usize, batch: &[String]) -> LoopControl {
        let _ = (page, index, batch);
        LoopControl::Continue
    }

    fn on_complete(&self, page: &Page) {
        let _ = page;
    }
}

/// Handler that logs every callback through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHandler;

impl Handler for TracingHandler {
    fn on_fields(&self, page: &Page, fields: &FieldMap) {
        tracing::info!(page_id = %page.id(), url = %page.url(), ?fields, "Fields collected");
    }

    fn on_loop(&self, page: &Page, index: usize, batch: &[String]) -> LoopControl {
        tracing::info!(page_id = %page.id(), %index, size = batch.len(), "Loop batch collected");
        LoopControl::Continue
    }

    fn on_complete(&self, page: &Page) {
        tracing::info!(page_id = %page.id(), url = %page.url(), "Page complete");
    }
}
