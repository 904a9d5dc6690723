use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::config::PipelineConfig;
use super::error::{HarvestError, Result, WebDriverError};
use super::gallery::{GalleryExtractor, GalleryPage, Thumbnail};
use super::pipeline::GalleryScraper;
use super::runtime::{CancelSignal, EventBus, sleep_or_cancel};
use super::types::{GalleryResult, SkuTask};
use super::webdriver::{ElementRef, WebDriverClient};

const READY_SCRIPT: &str = r#"
    return document.readyState === "complete" && !!document.querySelector(arguments[0]);
"#;

const DISMISS_OVERLAYS_SCRIPT: &str = r#"
    let clicked = 0;
    for (const sel of arguments[0]) {
        let el = null;
        try { el = document.querySelector(sel); } catch (e) { continue; }
        if (el && el.offsetParent !== null) { el.click(); clicked += 1; }
    }
    return clicked;
"#;

const THUMBNAILS_SCRIPT: &str = r#"
    return Array.from(document.querySelectorAll(arguments[0])).map(el => ({
        el: el,
        video: !!el.closest('[class*="video" i],[data-testid*="video" i],[aria-label*="video" i]')
    }));
"#;

const HERO_SRC_SCRIPT: &str = r#"
    const el = document.querySelector(arguments[0]);
    if (!el) { return null; }
    let src = el.currentSrc || el.src || el.getAttribute("data-zoom-image")
        || el.getAttribute("data-src") || el.getAttribute("data-original") || "";
    if (!src) {
        const set = el.getAttribute("srcset") || "";
        if (set) { src = set.split(",").pop().trim().split(" ")[0]; }
    }
    return src || null;
"#;

const SCROLL_SCRIPT: &str = r#"
    arguments[0].scrollIntoView({ block: "center", inline: "center" });
"#;

const JS_CLICK_SCRIPT: &str = "arguments[0].click();";

const SOURCE_SCRIPT: &str = r#"
    return document.documentElement ? document.documentElement.outerHTML : "";
"#;

/// Hands out at most `concurrency` live browser sessions; `acquire` waits
/// for a free slot instead of failing.
#[derive(Debug, Clone)]
pub struct SessionManager {
    client: WebDriverClient,
    cfg: Arc<PipelineConfig>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

#[derive(Debug)]
pub struct Session {
    client: WebDriverClient,
    cfg: Arc<PipelineConfig>,
    id: Option<String>,
    sku: String,
    _permit: OwnedSemaphorePermit,
}

impl SessionManager {
    pub fn new(cfg: Arc<PipelineConfig>) -> Result<Self> {
        let client = WebDriverClient::new(
            &cfg.webdriver_url,
            Duration::from_millis(cfg.request_timeout_ms),
        )?;
        let capacity = cfg.sanitized_concurrency();
        Ok(Self {
            client,
            cfg,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    pub fn open_sessions(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub async fn acquire(&self, sku: &str, cancel: &CancelSignal) -> Result<Session> {
        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit
                .map_err(|_| HarvestError::Config("session pool closed".to_string()))?,
            _ = cancel.cancelled() => return Err(HarvestError::Cancelled),
        };

        let id = self
            .client
            .create_session(self.cfg.browser, self.cfg.headless)
            .await
            .map_err(|err| navigation(sku, format!("session create failed: {err}")))?;
        tracing::debug!(sku, session = %id, "browser session opened");

        let session = Session {
            client: self.client.clone(),
            cfg: self.cfg.clone(),
            id: Some(id),
            sku: sku.to_string(),
            _permit: permit,
        };

        if let Err(err) = self.open_product_page(&session, cancel).await {
            self.release(session).await;
            return Err(err);
        }
        Ok(session)
    }

    pub async fn release(&self, mut session: Session) {
        if let Some(id) = session.id.take() {
            match self.client.delete_session(&id).await {
                Ok(()) => tracing::debug!(sku = %session.sku, session = %id, "browser session closed"),
                Err(err) => tracing::warn!(sku = %session.sku, session = %id, "session delete failed: {err}"),
            }
        }
    }

    async fn open_product_page(&self, session: &Session, cancel: &CancelSignal) -> Result<()> {
        let url = self.cfg.product_url(&session.sku);
        self.client
            .navigate(session.id(), &url)
            .await
            .map_err(|err| navigation(&session.sku, format!("navigate to {url} failed: {err}")))?;

        let timeout = Duration::from_millis(self.cfg.navigation_timeout_ms);
        let deadline = Instant::now() + timeout;
        loop {
            let ready = self
                .client
                .execute(session.id(), READY_SCRIPT, vec![json!(self.cfg.ready_selector)])
                .await
                .map(|v| v.as_bool().unwrap_or(false))
                .unwrap_or(false);
            if ready {
                break;
            }
            if Instant::now() >= deadline {
                return Err(navigation(
                    &session.sku,
                    format!(
                        "{url} not ready within {}ms (selector {:?})",
                        timeout.as_millis(),
                        self.cfg.ready_selector
                    ),
                ));
            }
            sleep_or_cancel(Duration::from_millis(self.cfg.poll_interval_ms), cancel).await?;
        }

        if !self.cfg.overlay_selectors.is_empty() {
            match self
                .client
                .execute(
                    session.id(),
                    DISMISS_OVERLAYS_SCRIPT,
                    vec![json!(self.cfg.overlay_selectors)],
                )
                .await
            {
                Ok(clicked) if clicked.as_u64().unwrap_or(0) > 0 => {
                    tracing::debug!(sku = %session.sku, overlays = %clicked, "dismissed overlays");
                    sleep_or_cancel(Duration::from_millis(self.cfg.settle_ms), cancel).await?;
                }
                Ok(_) => {}
                Err(err) => tracing::debug!(sku = %session.sku, "overlay dismissal failed: {err}"),
            }
        }
        Ok(())
    }
}

fn navigation(sku: &str, reason: String) -> HarvestError {
    HarvestError::Navigation {
        sku: sku.to_string(),
        reason,
    }
}

impl Session {
    fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    pub fn sku(&self) -> &str {
        &self.sku
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Reached without `release` only on panic or task abort.
        let Some(id) = self.id.take() else {
            return;
        };
        let client = self.client.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = client.delete_session(&id).await;
            });
        }
    }
}

impl GalleryPage for Session {
    type Element = ElementRef;

    async fn thumbnails(&self) -> Result<Vec<Thumbnail<ElementRef>>> {
        let value = self
            .client
            .execute(self.id(), THUMBNAILS_SCRIPT, vec![json!(self.cfg.thumbnail_selector)])
            .await?;
        Ok(parse_thumbnails(&value))
    }

    async fn scroll_into_view(&self, element: &ElementRef) -> Result<()> {
        self.client.execute_on(self.id(), SCROLL_SCRIPT, element).await?;
        Ok(())
    }

    async fn hover(&self, element: &ElementRef) -> Result<()> {
        self.client.hover(self.id(), element).await?;
        Ok(())
    }

    async fn click(&self, element: &ElementRef) -> Result<()> {
        match self.client.click(self.id(), element).await {
            Ok(()) => Ok(()),
            Err(WebDriverError::Protocol { error, .. })
                if error == "element click intercepted" || error == "element not interactable" =>
            {
                self.client.execute_on(self.id(), JS_CLICK_SCRIPT, element).await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn hero_src(&self) -> Result<Option<String>> {
        let value = self
            .client
            .execute(self.id(), HERO_SRC_SCRIPT, vec![json!(self.cfg.hero_selector)])
            .await?;
        Ok(value.as_str().map(ToString::to_string))
    }

    async fn page_source(&self) -> Result<String> {
        let value = self.client.execute(self.id(), SOURCE_SCRIPT, Vec::new()).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }
}

fn parse_thumbnails(value: &Value) -> Vec<Thumbnail<ElementRef>> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let element = ElementRef::from_wire(item.get("el")?)?;
                    let in_video = item.get("video").and_then(Value::as_bool).unwrap_or(false);
                    Some(Thumbnail { element, in_video })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Scraper backed by real browser sessions: acquire, extract, release.
#[derive(Debug, Clone)]
pub struct BrowserGalleryScraper {
    sessions: SessionManager,
    extractor: GalleryExtractor,
}

impl BrowserGalleryScraper {
    pub fn new(cfg: Arc<PipelineConfig>) -> Result<Self> {
        Ok(Self {
            extractor: GalleryExtractor::from_config(&cfg),
            sessions: SessionManager::new(cfg)?,
        })
    }
}

impl GalleryScraper for BrowserGalleryScraper {
    async fn scrape(
        &self,
        task: &SkuTask,
        cancel: &CancelSignal,
        events: &EventBus,
    ) -> Result<GalleryResult> {
        let session = self.sessions.acquire(&task.sku, cancel).await?;
        let outcome = self
            .extractor
            .extract(&session, &task.sku, cancel, events)
            .await;
        self.sessions.release(session).await;
        outcome
    }
}
