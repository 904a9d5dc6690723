use std::collections::HashSet;
use std::future::Future;
use std::time::{Duration, Instant};

use scraper::{Html, Selector};
use url::Url;

use super::config::{MIN_GALLERY_IMAGES, PipelineConfig};
use super::error::{HarvestError, Result};
use super::runtime::{CancelSignal, EventBus, sleep_or_cancel};
use super::types::{GalleryResult, ImageKind, ImageRef};

const IMAGE_EXTENSIONS: [&str; 6] = [".jpg", ".jpeg", ".png", ".webp", ".avif", ".gif"];

#[derive(Debug, Clone)]
pub struct Thumbnail<E> {
    pub element: E,
    /// Sits inside a video player; clicking it swaps the stage to a video.
    pub in_video: bool,
}

/// The slice of a rendered product page the extractor drives.
pub trait GalleryPage {
    type Element: Send + Sync;

    fn thumbnails(&self) -> impl Future<Output = Result<Vec<Thumbnail<Self::Element>>>> + Send;
    fn scroll_into_view(&self, element: &Self::Element) -> impl Future<Output = Result<()>> + Send;
    fn hover(&self, element: &Self::Element) -> impl Future<Output = Result<()>> + Send;
    fn click(&self, element: &Self::Element) -> impl Future<Output = Result<()>> + Send;
    fn hero_src(&self) -> impl Future<Output = Result<Option<String>>> + Send;
    fn page_source(&self) -> impl Future<Output = Result<String>> + Send;
}

#[derive(Debug, Clone)]
pub struct GalleryExtractor {
    settle: Duration,
    settle_timeout: Duration,
    poll_interval: Duration,
    max_images: usize,
    placeholder_patterns: Vec<String>,
    skip_hosts: Vec<String>,
    volatile_params: Vec<String>,
}

impl GalleryExtractor {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            settle: Duration::from_millis(cfg.settle_ms),
            settle_timeout: Duration::from_millis(cfg.settle_timeout_ms),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms.max(1)),
            max_images: cfg.max_images.max(MIN_GALLERY_IMAGES),
            placeholder_patterns: cfg
                .placeholder_patterns
                .iter()
                .map(|p| p.to_ascii_lowercase())
                .collect(),
            skip_hosts: cfg.skip_hosts.clone(),
            volatile_params: cfg.volatile_params.clone(),
        }
    }

    pub fn identity(&self, url: &str) -> String {
        image_identity(url, &self.volatile_params)
    }

    pub async fn extract<P: GalleryPage>(
        &self,
        page: &P,
        sku: &str,
        cancel: &CancelSignal,
        events: &EventBus,
    ) -> Result<GalleryResult> {
        let initial = match page.hero_src().await? {
            Some(src) if !src.trim().is_empty() => Some(src),
            _ => og_image(&page.page_source().await?),
        };
        let initial_identity = initial
            .as_deref()
            .filter(|url| self.accepts(url))
            .map(|url| self.identity(url));

        let mut gallery = GallerySet::default();
        if let Some(url) = initial.as_deref().filter(|url| self.accepts(url)) {
            gallery.push(self.identity(url), ImageRef::new(url, ImageKind::Hero));
        }

        let thumbnails = page.thumbnails().await?;
        let (playable, videos): (Vec<_>, Vec<_>) =
            thumbnails.into_iter().partition(|thumb| !thumb.in_video);
        if !videos.is_empty() {
            tracing::debug!(sku, skipped = videos.len(), "skipping video thumbnails");
        }

        if playable.is_empty() {
            if gallery.is_empty() {
                events.status(format!("{sku}: no thumbnails and no usable hero image"));
                return Ok(GalleryResult::empty(sku));
            }
            return Ok(GalleryResult::success(sku, gallery.into_images()));
        }

        let mut last_seen = initial.clone();
        for (index, thumb) in playable.iter().enumerate() {
            cancel.check()?;
            if gallery.len() >= self.max_images {
                break;
            }
            match self
                .settle_on(page, &thumb.element, index, &mut last_seen, &mut gallery, cancel)
                .await
            {
                Ok(src) => {
                    self.record(&mut gallery, &src, ImageKind::Gallery);
                    last_seen = Some(src);
                }
                Err(HarvestError::Cancelled) => return Err(HarvestError::Cancelled),
                Err(err @ HarvestError::ExtractionTimeout { .. }) => {
                    tracing::debug!(sku, index, "{err}");
                }
                Err(err) => {
                    events.error(format!("{sku}: thumbnail {index} interaction failed: {err}"));
                }
            }
        }

        let distinct = gallery
            .images
            .iter()
            .any(|image| Some(self.identity(&image.url)) != initial_identity);
        if !distinct {
            events.status(format!(
                "{sku}: {} thumbnails produced nothing beyond the hero image",
                playable.len()
            ));
            return Ok(GalleryResult::empty(sku));
        }

        Ok(GalleryResult::success(sku, gallery.into_images()))
    }

    /// Hover, settle, click, then wait for the stage image to move off the
    /// value it showed just before the click.
    async fn settle_on<P: GalleryPage>(
        &self,
        page: &P,
        element: &P::Element,
        index: usize,
        last_seen: &mut Option<String>,
        gallery: &mut GallerySet,
        cancel: &CancelSignal,
    ) -> Result<String> {
        page.scroll_into_view(element).await?;
        page.hover(element).await?;
        sleep_or_cancel(self.settle, cancel).await?;

        let before = page.hero_src().await?.filter(|src| !src.trim().is_empty());
        if let Some(src) = before.as_deref()
            && before != *last_seen
        {
            // An earlier thumbnail's swap landed after its wait ran out.
            self.record(gallery, src, ImageKind::Gallery);
            *last_seen = before.clone();
        }
        page.click(element).await?;

        let deadline = Instant::now() + self.settle_timeout;
        loop {
            if let Some(src) = page.hero_src().await?
                && !src.trim().is_empty()
                && Some(src.as_str()) != before.as_deref()
            {
                return Ok(src);
            }
            if Instant::now() >= deadline {
                return Err(HarvestError::ExtractionTimeout {
                    index,
                    timeout_ms: self.settle_timeout.as_millis() as u64,
                });
            }
            sleep_or_cancel(self.poll_interval, cancel).await?;
        }
    }

    fn record(&self, gallery: &mut GallerySet, url: &str, kind: ImageKind) {
        if gallery.len() < self.max_images && self.accepts(url) {
            gallery.push(self.identity(url), ImageRef::new(url, kind));
        }
    }

    fn accepts(&self, url: &str) -> bool {
        looks_like_product_image(url, &self.skip_hosts) && !self.is_placeholder(url)
    }

    fn is_placeholder(&self, url: &str) -> bool {
        let lower = url.to_ascii_lowercase();
        self.placeholder_patterns
            .iter()
            .any(|pattern| !pattern.is_empty() && lower.contains(pattern))
    }
}

#[derive(Debug, Default)]
struct GallerySet {
    images: Vec<ImageRef>,
    seen: HashSet<String>,
}

impl GallerySet {
    fn push(&mut self, identity: String, image: ImageRef) -> bool {
        if self.seen.insert(identity) {
            self.images.push(image);
            true
        } else {
            false
        }
    }

    fn len(&self) -> usize {
        self.images.len()
    }

    fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    fn into_images(self) -> Vec<ImageRef> {
        self.images
    }
}

/// Stable identity of an image asset: cache tokens, rendition sizes and
/// tracking parameters are dropped, the rest of the query is sorted.
pub fn image_identity(raw: &str, extra_volatile: &[String]) -> String {
    let trimmed = raw.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };

    let mut kept = url
        .query_pairs()
        .filter(|(k, _)| !is_volatile_param(k, extra_volatile))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect::<Vec<_>>();
    kept.sort();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in kept {
            serializer.append_pair(&k, &v);
        }
        url.set_query(Some(&serializer.finish()));
    }

    url.set_fragment(None);
    url.to_string()
}

fn is_volatile_param(param: &str, extra: &[String]) -> bool {
    let name = param.to_ascii_lowercase();
    if name.starts_with("utm_") || extra.iter().any(|e| e.eq_ignore_ascii_case(&name)) {
        return true;
    }
    matches!(
        name.as_str(),
        "v" | "ver"
            | "version"
            | "t"
            | "ts"
            | "timestamp"
            | "cb"
            | "cachebust"
            | "cache"
            | "_"
            | "rev"
            | "hash"
            | "w"
            | "h"
            | "wid"
            | "hei"
            | "width"
            | "height"
            | "size"
            | "sw"
            | "sh"
            | "fit"
            | "crop"
            | "q"
            | "qlt"
            | "quality"
            | "fmt"
            | "format"
            | "dpr"
            | "auto"
            | "gclid"
            | "fbclid"
            | "_gl"
    )
}

pub fn looks_like_product_image(src: &str, skip_hosts: &[String]) -> bool {
    let src = src.trim();
    if src.is_empty() || src.starts_with("data:") {
        return false;
    }
    let Ok(url) = Url::parse(src) else {
        return false;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    if skip_hosts.iter().any(|skip| host.contains(skip.as_str())) {
        return false;
    }
    let path = url.path().to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) || path.contains("/is/image/")
}

pub fn og_image(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let selector = Selector::parse(r#"meta[property="og:image"], meta[name="og:image"]"#).ok()?;
    doc.select(&selector)
        .filter_map(|meta| meta.value().attr("content"))
        .map(str::trim)
        .find(|content| !content.is_empty())
        .map(ToString::to_string)
}
