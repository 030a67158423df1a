use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chromiumoxide::cdp::browser_protocol::page::{EnableParams, EventLoadEventFired, NavigateParams};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::types::Command;
use chromiumoxide::{BrowserConfig, Page};
use futures::StreamExt;
use harvest_core::error::HarvestError;
use harvest_core::traits::{Browser, EventSink, LOAD_EVENT_FIRED, PendingResponse, Tab, TabEvent};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;

/// Headless Chromium driven over the Chrome DevTools Protocol.
///
/// A single Chromium process is shared across all clones; every
/// [`Browser::new_tab`] call opens a fresh `about:blank` target that the page
/// session then navigates itself.
///
/// # Example
///
/// ```rust,no_run
/// use std::path::Path;
/// use std::sync::Arc;
///
/// use harvest_client::ChromeBrowser;
/// use harvest_core::{Page, RuleStore, TracingHandler};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let store = RuleStore::new();
/// store.append_file(Path::new("rules/article.yml"))?;
///
/// let browser = ChromeBrowser::launch().await?;
/// let session = Page::new("p1", "https://example.com", "news")?
///     .collect(&browser, &store, Arc::new(TracingHandler))
///     .await?;
/// session.wait().await;
/// session.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ChromeBrowser {
    browser: Arc<chromiumoxide::Browser>,
    next_tab: Arc<AtomicU64>,
}

impl ChromeBrowser {
    /// Launches headless Chromium, locating the binary automatically.
    pub async fn launch() -> Result<Self, HarvestError> {
        Self::with_binary(None).await
    }

    /// Launches headless Chromium from `binary`, or from the first known
    /// location when `None`.
    pub async fn with_binary(binary: Option<PathBuf>) -> Result<Self, HarvestError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

        // Snap-packaged Chromium ships a wrapper that rejects the headless
        // flags, so prefer the real binary when it can be found.
        if let Some(bin) = binary.or_else(Self::find_chrome_binary) {
            tracing::info!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--disable-translate")
            .arg("--no-first-run")
            .build()
            .map_err(|e| HarvestError::Transport(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = chromiumoxide::Browser::launch(config)
            .await
            .map_err(|e| HarvestError::Transport(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
            next_tab: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Tries to locate the real Chrome/Chromium binary.
    ///
    /// `CHROME_BIN` wins when it points at an existing file. Returns `None`
    /// to let `chromiumoxide` do its own lookup.
    pub fn find_chrome_binary() -> Option<PathBuf> {
        let candidates: &[&str] = &[
            // Snap (Ubuntu default)
            "/snap/chromium/current/usr/lib/chromium-browser/chrome",
            // Flatpak
            "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
        ];

        if let Ok(p) = std::env::var("CHROME_BIN") {
            let path = PathBuf::from(&p);
            if path.exists() {
                return Some(path);
            }
        }

        candidates.iter().map(PathBuf::from).find(|p| p.exists())
    }
}

impl Browser for ChromeBrowser {
    type Tab = ChromeTab;

    async fn new_tab(&self, sink: EventSink) -> Result<ChromeTab, HarvestError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| HarvestError::Transport(format!("Failed to open tab: {e}")))?;
        let id = format!("tab-{}", self.next_tab.fetch_add(1, Ordering::Relaxed) + 1);
        tracing::debug!(tab = %id, "Tab opened");

        Ok(ChromeTab {
            id,
            page,
            sink,
            next_call: Arc::new(AtomicU64::new(0)),
            listeners: Arc::default(),
        })
    }
}

/// One Chromium target.
///
/// Commands run on spawned tasks so [`Tab::call`] returns as soon as the
/// command is queued; subscriptions forward CDP events into the sink until
/// the tab is closed.
#[derive(Clone)]
pub struct ChromeTab {
    id: String,
    page: Page,
    sink: EventSink,
    next_call: Arc<AtomicU64>,
    listeners: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ChromeTab {
    fn spawn_command<C>(&self, id: u64, command: C) -> PendingResponse
    where
        C: Command + Send + 'static,
        C::Response: Serialize + Send,
    {
        let (pending, tx) = PendingResponse::channel(id);
        let page = self.page.clone();
        let method = command.identifier();
        tokio::spawn(async move {
            let result = match page.execute(command).await {
                Ok(response) => serde_json::to_value(&response.result).map_err(|e| {
                    HarvestError::Transport(format!("{method} response not serializable: {e}"))
                }),
                Err(e) => Err(HarvestError::Transport(format!("{method} failed: {e}"))),
            };
            let _ = tx.send(result);
        });
        pending
    }
}

fn decode<P: DeserializeOwned>(method: &str, params: Value) -> Result<P, HarvestError> {
    serde_json::from_value(params)
        .map_err(|e| HarvestError::Transport(format!("Invalid params for {method}: {e}")))
}

impl Tab for ChromeTab {
    fn id(&self) -> &str {
        &self.id
    }

    async fn subscribe(&self, event: &str) -> Result<(), HarvestError> {
        if event != LOAD_EVENT_FIRED {
            return Err(HarvestError::Transport(format!(
                "Unsupported event subscription: {event}"
            )));
        }
        let mut events = self
            .page
            .event_listener::<EventLoadEventFired>()
            .await
            .map_err(|e| HarvestError::Transport(format!("Failed to subscribe to {event}: {e}")))?;

        let sink = self.sink.clone();
        let tab = self.id.clone();
        let forward = tokio::spawn(async move {
            while let Some(fired) = events.next().await {
                let params = serde_json::to_value(fired.as_ref()).unwrap_or_default();
                if sink.send(TabEvent::new(LOAD_EVENT_FIRED, params)).is_err() {
                    break;
                }
            }
            tracing::trace!(%tab, "Load event listener finished");
        });
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(forward);
        Ok(())
    }

    async fn call(&self, method: &str, params: Value) -> Result<PendingResponse, HarvestError> {
        let id = self.next_call.fetch_add(1, Ordering::Relaxed) + 1;
        let pending = match method {
            "Runtime.evaluate" => {
                self.spawn_command(id, decode::<EvaluateParams>(method, params)?)
            }
            "Page.enable" => self.spawn_command(id, decode::<EnableParams>(method, params)?),
            "Page.navigate" => self.spawn_command(id, decode::<NavigateParams>(method, params)?),
            other => {
                return Err(HarvestError::Transport(format!(
                    "Unsupported command: {other}"
                )));
            }
        };
        tracing::trace!(tab = %self.id, %method, id, "Command sent");
        Ok(pending)
    }

    fn fire(&self, event: TabEvent) -> Result<(), HarvestError> {
        self.sink
            .send(event)
            .map_err(|_| HarvestError::Transport(format!("Event sink of {} closed", self.id)))
    }

    async fn close(&self) -> Result<(), HarvestError> {
        for listener in self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            listener.abort();
        }
        self.page
            .clone()
            .close()
            .await
            .map_err(|e| HarvestError::Transport(format!("Failed to close {}: {e}", self.id)))?;
        tracing::debug!(tab = %self.id, "Tab closed");
        Ok(())
    }
}
