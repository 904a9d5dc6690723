use std::collections::HashSet;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};

use super::config::{BrowserKind, PipelineConfig};

#[derive(Debug, Parser, Clone)]
#[command(
    name = "gallery-harvest",
    version,
    about = "Harvest product image galleries through WebDriver into a curated JSON catalogue"
)]
pub struct Cli {
    /// JSON file with pipeline settings; flags override it.
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, value_name = "FILE", default_value = "images.json")]
    pub catalogue: PathBuf,

    /// Keep only the newest N catalogue backups after each write.
    #[arg(long, global = true, value_name = "N")]
    pub keep_backups: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
#[command(rename_all = "kebab-case")]
pub enum Command {
    /// Scrape galleries for a SKU list and merge them into the catalogue
    Scrape(ScrapeArgs),
    /// Print the catalogue for review
    Review(ReviewArgs),
    /// Apply keep/drop decisions to the catalogue
    Curate(CurateArgs),
}

#[derive(Debug, Args, Clone)]
pub struct ScrapeArgs {
    /// SKUs separated by commas or newlines.
    #[arg(long, value_name = "LIST", conflicts_with = "skus_file")]
    pub skus: Option<String>,

    /// File with SKUs separated by commas or newlines; `-` reads stdin.
    #[arg(long, value_name = "FILE")]
    pub skus_file: Option<PathBuf>,

    #[arg(long, value_name = "URL")]
    pub product_url_template: Option<String>,

    #[arg(long, value_name = "URL")]
    pub webdriver_url: Option<String>,

    #[arg(long, value_enum)]
    pub browser: Option<BrowserKind>,

    #[arg(long, value_name = "BOOL")]
    pub headless: Option<bool>,

    #[arg(long, value_name = "N")]
    pub concurrency: Option<usize>,

    #[arg(long, value_name = "N")]
    pub max_retries: Option<usize>,

    #[arg(long, value_name = "MS")]
    pub settle_ms: Option<u64>,

    #[arg(long, value_name = "MS")]
    pub settle_timeout_ms: Option<u64>,

    #[arg(long, value_name = "MS")]
    pub navigation_timeout_ms: Option<u64>,

    /// Write a per-SKU CSV report of the run.
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,

    /// Scrape and report without touching the catalogue.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

impl ScrapeArgs {
    pub fn apply_to(&self, cfg: &mut PipelineConfig) {
        if let Some(v) = &self.product_url_template {
            cfg.product_url_template = v.clone();
        }
        if let Some(v) = &self.webdriver_url {
            cfg.webdriver_url = v.clone();
        }
        if let Some(v) = self.browser {
            cfg.browser = v;
        }
        if let Some(v) = self.headless {
            cfg.headless = v;
        }
        if let Some(v) = self.concurrency {
            cfg.concurrency = v;
        }
        if let Some(v) = self.max_retries {
            cfg.max_retries = v;
        }
        if let Some(v) = self.settle_ms {
            cfg.settle_ms = v;
        }
        if let Some(v) = self.settle_timeout_ms {
            cfg.settle_timeout_ms = v;
        }
        if let Some(v) = self.navigation_timeout_ms {
            cfg.navigation_timeout_ms = v;
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct ReviewArgs {
    /// Limit the listing to these SKUs (repeatable).
    #[arg(long = "sku", value_name = "SKU")]
    pub skus: Vec<String>,

    /// Run report whose failed/empty SKUs should be listed for re-queueing.
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Debug, Args, Clone)]
pub struct CurateArgs {
    #[arg(long, value_name = "SKU", required_unless_present = "decisions")]
    pub sku: Option<String>,

    /// Image URL to keep (repeatable); everything else is dropped.
    #[arg(long = "keep", value_name = "URL")]
    pub keep: Vec<String>,

    /// Remove the SKU from the catalogue entirely.
    #[arg(long = "drop", default_value_t = false)]
    pub drop_sku: bool,

    /// JSON array of decisions: [{"sku": .., "kept_images": [..], "drop_sku": false}].
    #[arg(long, value_name = "FILE", conflicts_with = "sku")]
    pub decisions: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkuTask {
    pub sku: String,
    pub attempt: u32,
}

impl SkuTask {
    pub fn new(sku: impl Into<String>) -> Self {
        Self {
            sku: sku.into(),
            attempt: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    Hero,
    Gallery,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub url: String,
    pub kind: ImageKind,
}

impl ImageRef {
    pub fn new(url: impl Into<String>, kind: ImageKind) -> Self {
        Self {
            url: url.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GalleryStatus {
    Success,
    Empty,
    Failed,
    Cancelled,
}

impl GalleryStatus {
    pub fn label(self) -> &'static str {
        match self {
            GalleryStatus::Success => "success",
            GalleryStatus::Empty => "empty",
            GalleryStatus::Failed => "failed",
            GalleryStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "success" => Some(GalleryStatus::Success),
            "empty" => Some(GalleryStatus::Empty),
            "failed" => Some(GalleryStatus::Failed),
            "cancelled" => Some(GalleryStatus::Cancelled),
            _ => None,
        }
    }

    /// Statuses an operator should re-queue.
    pub fn needs_attention(self) -> bool {
        !matches!(self, GalleryStatus::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GalleryResult {
    pub sku: String,
    pub images: Vec<ImageRef>,
    pub status: GalleryStatus,
    pub error: Option<String>,
}

impl GalleryResult {
    pub fn success(sku: impl Into<String>, images: Vec<ImageRef>) -> Self {
        Self {
            sku: sku.into(),
            images,
            status: GalleryStatus::Success,
            error: None,
        }
    }

    pub fn empty(sku: impl Into<String>) -> Self {
        Self {
            sku: sku.into(),
            images: Vec::new(),
            status: GalleryStatus::Empty,
            error: None,
        }
    }

    pub fn failed(sku: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            sku: sku.into(),
            images: Vec::new(),
            status: GalleryStatus::Failed,
            error: Some(error.into()),
        }
    }

    pub fn cancelled(sku: impl Into<String>) -> Self {
        Self {
            sku: sku.into(),
            images: Vec::new(),
            status: GalleryStatus::Cancelled,
            error: None,
        }
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image_urls(&self) -> Vec<String> {
        self.images.iter().map(|image| image.url.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurationDecision {
    pub sku: String,
    #[serde(default)]
    pub kept_images: HashSet<String>,
    #[serde(default)]
    pub drop_sku: bool,
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    SkuFinished {
        sku: String,
        status: GalleryStatus,
        image_count: usize,
    },
    Log(String),
    Error(String),
    Finished,
}

/// Catalogue key for a SKU: trimmed, `_` folded to `-`, ASCII uppercase.
pub fn sku_key(raw: &str) -> String {
    raw.trim().replace('_', "-").to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sku_keys_fold_case_and_separators() {
        assert_eq!(sku_key("  ab1234_001 "), "AB1234-001");
        assert_eq!(sku_key("AB1234-001"), "AB1234-001");
    }

    #[test]
    fn status_labels_round_trip() {
        for status in [
            GalleryStatus::Success,
            GalleryStatus::Empty,
            GalleryStatus::Failed,
            GalleryStatus::Cancelled,
        ] {
            assert_eq!(GalleryStatus::from_label(status.label()), Some(status));
        }
        assert_eq!(GalleryStatus::from_label("bogus"), None);
    }

    #[test]
    fn cli_overrides_only_named_settings() {
        let cli = Cli::parse_from([
            "gallery-harvest",
            "scrape",
            "--skus",
            "A,B",
            "--concurrency",
            "4",
            "--browser",
            "firefox",
        ]);
        let Command::Scrape(args) = cli.command else {
            panic!("expected scrape");
        };
        let mut cfg = PipelineConfig::default();
        args.apply_to(&mut cfg);
        assert_eq!(cfg.concurrency, 4);
        assert_eq!(cfg.browser, BrowserKind::Firefox);
        assert_eq!(cfg.max_retries, PipelineConfig::default().max_retries);
        assert_eq!(cli.catalogue, PathBuf::from("images.json"));
    }
}
