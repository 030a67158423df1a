//! Per-page collection session.
//!
//! A [`Page`] is matched against the rule store, gets its own tab and is
//! navigated. The first `Page.loadEventFired` to arrive, whether delivered
//! by the browser or synthesized by the rule's timeout, claims the
//! completion gate and runs fields, loop and completion. Every later signal
//! is ignored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};

use crate::error::HarvestError;
use crate::fields::extract_fields;
use crate::looping::run_loop;
use crate::rule::Rule;
use crate::script::ScriptBridge;
use crate::store::RuleStore;
use crate::traits::{Browser, Handler, LOAD_EVENT_FIRED, Tab, TabEvent};
use crate::util::decode_html_entities;

/// A page to collect: caller-assigned id, target URL and rule group.
#[derive(Debug, Clone)]
pub struct Page {
    id: String,
    url: String,
    group: String,
    rule: Option<Arc<Rule>>,
}

impl Page {
    /// Create a page. `url` and `group` must be non-empty.
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        group: impl Into<String>,
    ) -> Result<Self, HarvestError> {
        let url = url.into();
        let group = group.into();
        if url.is_empty() {
            return Err(HarvestError::InvalidArgument("page url is empty".into()));
        }
        if group.is_empty() {
            return Err(HarvestError::InvalidArgument("page group is empty".into()));
        }
        Ok(Self {
            id: id.into(),
            url,
            group,
            rule: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// The rule bound by [`Page::collect`], if any.
    pub fn rule(&self) -> Option<&Arc<Rule>> {
        self.rule.as_ref()
    }

    /// Match a rule, open a tab and start navigating.
    ///
    /// The load timeout is armed as soon as the navigate command is sent.
    /// Returns when navigation has been answered or a load signal, real or
    /// synthetic, has started extraction, whichever comes first. Extraction
    /// then runs in the background and reports through `handler`, even if
    /// the returned session is dropped. Fails with
    /// [`HarvestError::NoRuleMatched`] before any tab is opened, or with
    /// [`HarvestError::Transport`] after closing the tab it opened.
    pub async fn collect<B: Browser>(
        mut self,
        browser: &B,
        store: &RuleStore,
        handler: Arc<dyn Handler>,
    ) -> Result<PageSession<B::Tab>, HarvestError> {
        let rule = store
            .match_url(&self.group, &self.url)
            .ok_or_else(|| HarvestError::NoRuleMatched {
                group: self.group.clone(),
                url: self.url.clone(),
            })?;
        tracing::info!(page_id = %self.id, url = %self.url, rule = %rule.id, version = rule.version, "Rule matched");

        let (sink, events) = mpsc::unbounded_channel();
        let tab = browser.new_tab(sink).await?;
        self.rule = Some(Arc::clone(&rule));

        let (state, _) = watch::channel(SessionState::Created);
        let session = PageSession {
            inner: Arc::new(SessionInner {
                page: self,
                rule,
                tab,
                handler,
                gate: CompletionGate::default(),
                state,
            }),
        };

        let mut navigation = match session.navigate().await {
            Ok(navigation) => navigation,
            Err(e) => return Err(session.abort(e).await),
        };
        session.arm_timeout();
        session.spawn_pump(events);

        let mut loaded = session.inner.state.subscribe();
        tokio::select! {
            biased;
            result = &mut navigation => {
                if let Err(e) = result {
                    if session.inner.gate.claim() {
                        return Err(session.abort(e).await);
                    }
                    tracing::warn!(page_id = %session.page().id(), error = %e, "Navigation failed after load signal");
                }
            }
            _ = loaded.wait_for(|s| *s >= SessionState::Loaded) => {
                let page_id = session.page().id().to_string();
                tokio::spawn(async move {
                    if let Err(e) = navigation.await {
                        tracing::warn!(%page_id, error = %e, "Navigation answered with an error");
                    }
                });
            }
        }
        Ok(session)
    }
}

/// Outcome of the enable and navigate commands, awaited after the timeout is armed.
type Navigation = Pin<Box<dyn Future<Output = Result<(), HarvestError>> + Send>>;

/// One-shot claim shared by the real and the synthetic load signal.
#[derive(Debug, Default)]
pub struct CompletionGate(AtomicBool);

impl CompletionGate {
    /// Returns true for exactly one caller.
    pub fn claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Progress of a session. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Created,
    Navigating,
    Loaded,
    FieldsDone,
    LoopDone,
    LoopSkipped,
    Completed,
    Closed,
}

struct SessionInner<T: Tab> {
    page: Page,
    rule: Arc<Rule>,
    tab: T,
    handler: Arc<dyn Handler>,
    gate: CompletionGate,
    state: watch::Sender<SessionState>,
}

impl<T: Tab> SessionInner<T> {
    fn advance(&self, next: SessionState) {
        let moved = self.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(page_id = %self.page.id, state = ?next, "Session state");
        }
    }
}

impl<T: Tab> Drop for SessionInner<T> {
    fn drop(&mut self) {
        if *self.state.borrow() >= SessionState::Closed {
            return;
        }
        tracing::debug!(page_id = %self.page.id, "Session dropped without close, releasing tab");
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let tab = self.tab.clone();
        runtime.spawn(async move {
            if let Err(e) = tab.close().await {
                tracing::debug!(error = %e, "Tab close on drop");
            }
        });
    }
}

/// A page being collected in its own tab.
pub struct PageSession<T: Tab> {
    inner: Arc<SessionInner<T>>,
}

impl<T: Tab> Clone for PageSession<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Tab> PageSession<T> {
    pub fn page(&self) -> &Page {
        &self.inner.page
    }

    pub fn rule(&self) -> &Arc<Rule> {
        &self.inner.rule
    }

    pub fn tab(&self) -> &T {
        &self.inner.tab
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Resolve once the session completed or was closed, returning that state.
    pub async fn wait(&self) -> SessionState {
        let mut rx = self.inner.state.subscribe();
        rx.wait_for(|s| *s >= SessionState::Completed)
            .await
            .map(|s| *s)
            .unwrap_or(SessionState::Closed)
    }

    /// Release the tab.
    ///
    /// Before the load signal this abandons the page: no callback will run.
    pub async fn close(&self) -> Result<(), HarvestError> {
        if self.inner.gate.claim() {
            tracing::info!(page_id = %self.page().id(), "Page abandoned before load");
        }
        self.inner.advance(SessionState::Closed);
        self.inner.tab.close().await
    }

    /// Deliver a tab event. Returns true if it claimed the completion gate
    /// and started the extraction pipeline.
    pub fn on_event(&self, event: TabEvent) -> bool {
        if !event.is_load_fired() {
            tracing::trace!(page_id = %self.page().id(), method = %event.method, "Ignoring event");
            return false;
        }
        if !self.inner.gate.claim() {
            tracing::debug!(page_id = %self.page().id(), synthetic = event.synthetic, "Load signal after gate claimed");
            return false;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(run_pipeline(inner, event.synthetic));
        true
    }

    /// Subscribe, then send enable and navigate. The returned future
    /// resolves with the outcome of both commands.
    async fn navigate(&self) -> Result<Navigation, HarvestError> {
        let inner = &self.inner;
        inner.advance(SessionState::Navigating);
        inner.tab.subscribe(LOAD_EVENT_FIRED).await?;

        let url = decode_html_entities(&inner.page.url).into_owned();
        let enable = inner.tab.call("Page.enable", json!({})).await?;
        let navigate = inner.tab.call("Page.navigate", json!({ "url": url })).await?;

        Ok(Box::pin(async move {
            enable.response().await?;
            let response = navigate.response().await?;
            match response.get("errorText").and_then(Value::as_str) {
                Some(error) => Err(HarvestError::Transport(format!(
                    "navigation to {url} failed: {error}"
                ))),
                None => Ok(()),
            }
        }))
    }

    async fn abort(&self, e: HarvestError) -> HarvestError {
        tracing::warn!(page_id = %self.page().id(), error = %e, "Navigation failed, closing tab");
        self.inner.advance(SessionState::Closed);
        if let Err(close_err) = self.inner.tab.close().await {
            tracing::debug!(error = %close_err, "Tab close after failed navigation");
        }
        e
    }

    fn arm_timeout(&self) {
        let weak: Weak<SessionInner<T>> = Arc::downgrade(&self.inner);
        let timeout = self.inner.rule.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.gate.is_claimed() {
                return;
            }
            tracing::debug!(page_id = %inner.page.id, ?timeout, "Load timeout elapsed");
            if let Err(e) = inner.tab.fire(TabEvent::load_fired().into_synthetic()) {
                tracing::warn!(page_id = %inner.page.id, error = %e, "Synthetic load event not delivered");
            }
        });
    }

    /// Dispatch tab events until the session completes or is closed. The
    /// pump keeps the session alive so a dropped handle still gets collected.
    fn spawn_pump(&self, mut events: mpsc::UnboundedReceiver<TabEvent>) {
        let session = self.clone();
        let mut state = self.inner.state.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        session.on_event(event);
                    }
                    _ = state.wait_for(|s| *s >= SessionState::Completed) => break,
                }
            }
        });
    }
}

async fn run_pipeline<T: Tab>(inner: Arc<SessionInner<T>>, synthetic: bool) {
    let page = &inner.page;
    if synthetic {
        tracing::warn!(page_id = %page.id, url = %page.url, timeout = ?inner.rule.timeout, "No load event before timeout, collecting anyway");
    }
    inner.advance(SessionState::Loaded);

    let bridge = ScriptBridge::new(&inner.tab);
    let fields = extract_fields(&bridge, &inner.rule).await;
    inner.handler.on_fields(page, &fields);
    inner.advance(SessionState::FieldsDone);

    match &inner.rule.looping {
        Some(lp) => {
            let summary = run_loop(&bridge, page, lp, inner.handler.as_ref()).await;
            tracing::info!(page_id = %page.id, iterations = summary.iterations, batches = summary.batches, end = ?summary.end, "Loop finished");
            inner.advance(SessionState::LoopDone);
        }
        None => inner.advance(SessionState::LoopSkipped),
    }

    inner.handler.on_complete(page);
    inner.advance(SessionState::Completed);
    tracing::info!(page_id = %page.id, fields = fields.len(), "Page collected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockBrowser, RecordingHandler, rule_yaml, string_result};

    fn store_with(yaml: &str) -> RuleStore {
        let store = RuleStore::new();
        store.append(yaml.as_bytes()).unwrap();
        store
    }

    #[test]
    fn page_requires_url_and_group() {
        assert!(matches!(
            Page::new("p", "", "g"),
            Err(HarvestError::InvalidArgument(_))
        ));
        assert!(matches!(
            Page::new("p", "https://a.com", ""),
            Err(HarvestError::InvalidArgument(_))
        ));
        let page = Page::new("p", "https://a.com", "g").unwrap();
        assert!(page.rule().is_none());
    }

    #[test]
    fn gate_claims_once() {
        let gate = CompletionGate::default();
        assert!(!gate.is_claimed());
        assert!(gate.claim());
        assert!(!gate.claim());
        assert!(gate.is_claimed());
    }

    #[test]
    fn states_are_ordered() {
        assert!(SessionState::Created < SessionState::Navigating);
        assert!(SessionState::FieldsDone < SessionState::LoopDone);
        assert!(SessionState::LoopSkipped < SessionState::Completed);
        assert!(SessionState::Completed < SessionState::Closed);
    }

    #[tokio::test]
    async fn no_match_opens_no_tab() {
        let store = store_with(&rule_yaml("r", 1, "g", 0, r"^https://shop\.com/"));
        let browser = MockBrowser::new(|_, _| string_result(""));
        let page = Page::new("p", "https://other.com/", "g").unwrap();

        let err = page
            .collect(&browser, &store, Arc::new(RecordingHandler::new()))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, HarvestError::NoRuleMatched { .. }));
        assert!(browser.tabs().is_empty());
    }

    #[tokio::test]
    async fn collect_runs_pipeline_once() {
        let store = store_with(
            "id: r\ngroup: g\npatterns: ['^https://shop\\.com/']\nfields:\n  - name: title\n    eval: 'document.title'\n",
        );
        let browser = MockBrowser::new(|_, _| string_result("Shop"));
        let handler = RecordingHandler::new();
        let page = Page::new("p", "https://shop.com/item?a=1&amp;b=2", "g").unwrap();

        let session = page
            .collect(&browser, &store, Arc::new(handler.clone()))
            .await
            .unwrap();
        assert_eq!(session.wait().await, SessionState::Completed);

        assert_eq!(handler.fields()[0]["title"], "Shop");
        assert_eq!(handler.completions(), 1);
        assert_eq!(session.page().rule().unwrap().id, "r");

        let tab = session.tab();
        assert_eq!(tab.subscriptions(), [LOAD_EVENT_FIRED]);
        let calls = tab.calls();
        assert_eq!(calls[0].method, "Page.enable");
        assert_eq!(calls[1].method, "Page.navigate");
        assert_eq!(calls[1].params["url"], "https://shop.com/item?a=1&b=2");

        session.close().await.unwrap();
        assert!(tab.is_closed());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn late_signal_is_ignored() {
        let store = store_with(&rule_yaml("r", 1, "g", 0, "shop"));
        let browser = MockBrowser::new(|_, _| string_result(""));
        let handler = RecordingHandler::new();
        let session = Page::new("p", "https://shop.com", "g")
            .unwrap()
            .collect(&browser, &store, Arc::new(handler.clone()))
            .await
            .unwrap();
        session.wait().await;

        assert!(!session.on_event(TabEvent::load_fired().into_synthetic()));
        assert!(!session.on_event(TabEvent::new("Page.frameNavigated", Value::Null)));
        assert_eq!(handler.completions(), 1);
    }

    #[tokio::test]
    async fn close_before_load_abandons_page() {
        let store = store_with(
            "id: r\ngroup: g\ntimeout: 1h\npatterns: ['shop']\nfields:\n  - name: a\n    value: 'x'\n",
        );
        let browser = MockBrowser::new(|_, _| string_result("")).without_load_event();
        let handler = RecordingHandler::new();
        let session = Page::new("p", "https://shop.com", "g")
            .unwrap()
            .collect(&browser, &store, Arc::new(handler.clone()))
            .await
            .unwrap();

        session.close().await.unwrap();
        assert!(!session.on_event(TabEvent::load_fired()));
        assert_eq!(session.wait().await, SessionState::Closed);
        assert!(handler.events().is_empty());
    }
}
