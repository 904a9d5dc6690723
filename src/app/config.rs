use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::{HarvestError, Result};

pub const MAX_CONCURRENCY: usize = 32;
/// Hero plus at least one interacted image; a lower cap could never succeed.
pub const MIN_GALLERY_IMAGES: usize = 2;

/// Browser the WebDriver endpoint should drive.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BrowserKind {
    #[default]
    Chrome,
    Firefox,
    Edge,
}

/// Tunables for one pipeline run. Every field has a default so a config file
/// only needs to name what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Product page URL; `{sku}` is replaced by the URL-encoded SKU.
    pub product_url_template: String,
    pub webdriver_url: String,
    pub browser: BrowserKind,
    pub headless: bool,
    pub request_timeout_ms: u64,

    pub concurrency: usize,
    pub max_retries: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    pub navigation_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub ready_selector: String,
    pub overlay_selectors: Vec<String>,

    pub hero_selector: String,
    pub thumbnail_selector: String,
    pub settle_ms: u64,
    pub settle_timeout_ms: u64,
    pub max_images: usize,

    /// Substrings that mark a URL as a site placeholder rather than a product shot.
    pub placeholder_patterns: Vec<String>,
    pub skip_hosts: Vec<String>,
    /// Extra query parameter names dropped when computing image identity.
    pub volatile_params: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            product_url_template: String::new(),
            webdriver_url: "http://localhost:4444".to_string(),
            browser: BrowserKind::Chrome,
            headless: true,
            request_timeout_ms: 30_000,
            concurrency: 1,
            max_retries: 2,
            backoff_base_ms: 1_000,
            backoff_max_ms: 15_000,
            navigation_timeout_ms: 20_000,
            poll_interval_ms: 100,
            ready_selector: "img".to_string(),
            overlay_selectors: vec![
                "button#onetrust-accept-btn-handler".to_string(),
                "button[aria-label='Close']".to_string(),
                "button[data-testid='modal-close']".to_string(),
                "button[data-testid='modal-close-button']".to_string(),
            ],
            hero_selector: "[data-testid='HeroImgContainer'] img".to_string(),
            thumbnail_selector: "[data-testid^='Thumbnail-']:not([data-testid*='Thumbnail-Img-'])"
                .to_string(),
            settle_ms: 150,
            settle_timeout_ms: 2_500,
            max_images: 9,
            placeholder_patterns: vec![
                "/placeholder".to_string(),
                "no-image".to_string(),
                "lazyload".to_string(),
            ],
            skip_hosts: vec![
                "facebook.com".to_string(),
                "google.".to_string(),
                "gstatic.com".to_string(),
                "twitter.com".to_string(),
                "doubleclick.net".to_string(),
            ],
            volatile_params: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| {
            HarvestError::Config(format!(
                "failed to parse config at {}: {e}",
                path.to_string_lossy()
            ))
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !self.product_url_template.contains("{sku}") {
            return Err(HarvestError::Config(
                "product_url_template must contain a {sku} placeholder".to_string(),
            ));
        }
        if url::Url::parse(&self.product_url_template.replace("{sku}", "SKU")).is_err() {
            return Err(HarvestError::Config(format!(
                "product_url_template is not a valid URL: {}",
                self.product_url_template
            )));
        }
        if self.hero_selector.trim().is_empty() || self.thumbnail_selector.trim().is_empty() {
            return Err(HarvestError::Config(
                "hero_selector and thumbnail_selector must be set".to_string(),
            ));
        }
        if self.max_images < MIN_GALLERY_IMAGES {
            return Err(HarvestError::Config(format!(
                "max_images must be at least {MIN_GALLERY_IMAGES}, got {}",
                self.max_images
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(HarvestError::Config("poll_interval_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn product_url(&self, sku: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(sku.as_bytes()).collect();
        self.product_url_template.replace("{sku}", &encoded)
    }

    pub fn sanitized_concurrency(&self) -> usize {
        sanitize_concurrency(self.concurrency)
    }
}

pub fn sanitize_concurrency(value: usize) -> usize {
    value.clamp(1, MAX_CONCURRENCY)
}
