pub mod catalogue;
pub mod config;
pub mod curation;
pub mod data_io;
pub mod error;
pub mod gallery;
pub mod pipeline;
pub mod runtime;
pub mod session;
pub mod types;
pub mod webdriver;

use std::process::ExitCode;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use catalogue::CatalogueStore;
use config::PipelineConfig;
use curation::{CurationService, ReviewEntry};
use data_io::{load_decisions, load_report, read_sku_input, write_report};
use error::{HarvestError, Result, WebDriverError};
use pipeline::{PipelineRunner, RunSummary};
use runtime::{CancelSignal, EventBus};
use session::BrowserGalleryScraper;
use types::{Cli, Command, CurateArgs, CurationDecision, GalleryResult, PipelineEvent, ReviewArgs, ScrapeArgs};

/// Logs go to stderr; stdout is kept for review output.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

pub async fn run(cli: Cli) -> Result<ExitCode> {
    match &cli.command {
        Command::Scrape(args) => scrape(&cli, args).await,
        Command::Review(args) => review(&cli, args),
        Command::Curate(args) => curate(&cli, args),
    }
}

fn open_store(cli: &Cli) -> Result<Arc<CatalogueStore>> {
    let store = CatalogueStore::open(&cli.catalogue)?.with_keep_backups(cli.keep_backups);
    Ok(Arc::new(store))
}

async fn scrape(cli: &Cli, args: &ScrapeArgs) -> Result<ExitCode> {
    let mut cfg = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    args.apply_to(&mut cfg);
    cfg.validate()?;

    let skus = read_sku_input(args.skus.as_deref(), args.skus_file.as_deref())?;
    if skus.is_empty() {
        return Err(HarvestError::Config("SKU list is empty".to_string()));
    }

    // A corrupt catalogue must stop the run before any browser work.
    let store = if args.dry_run {
        None
    } else {
        Some(open_store(cli)?)
    };

    if !webdriver::endpoint_reachable(&cfg.webdriver_url).await {
        return Err(WebDriverError::Unreachable(cfg.webdriver_url.clone()).into());
    }

    let cfg = Arc::new(cfg);
    let events = EventBus::default();
    let cancel = CancelSignal::new();
    let scraper = BrowserGalleryScraper::new(cfg.clone())?;
    let runner = PipelineRunner::new(scraper, &cfg, cancel.clone(), events.clone());

    let progress = tokio::spawn(print_progress(events.subscribe(), skus.len()));
    let interrupt = {
        let cancel = cancel.clone();
        let events = events.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                events.status("interrupt received; stopping the run");
                cancel.cancel();
            }
        })
    };

    let results = runner.run(&skus).await;
    interrupt.abort();
    if let Err(err) = progress.await {
        tracing::warn!("progress printer failed: {err}");
    }

    if let Some(path) = &args.report {
        write_report(path, &results)?;
        tracing::info!(path = %path.display(), "run report written");
    }

    let summary = RunSummary::from_results(&results);
    eprintln!(
        "finished run: success={} empty={} failed={} cancelled={} images={}",
        summary.success, summary.empty, summary.failed, summary.cancelled, summary.images
    );

    if let Some(store) = store {
        let merge = store.merge(&results);
        if merge.changed() {
            store.persist()?;
        }
        eprintln!(
            "catalogue {}: added={} updated={} unchanged={} untouched={}",
            store.path().display(),
            merge.added.len(),
            merge.updated.len(),
            merge.unchanged.len(),
            merge.skipped.len()
        );
    }

    print_requeue(&results);
    Ok(ExitCode::SUCCESS)
}

async fn print_progress(mut rx: broadcast::Receiver<PipelineEvent>, total: usize) {
    let mut done = 0usize;
    loop {
        match rx.recv().await {
            Ok(PipelineEvent::SkuFinished {
                sku,
                status,
                image_count,
            }) => {
                done += 1;
                eprintln!("[{done}/{total}] {sku}: {} ({image_count} images)", status.label());
            }
            Ok(PipelineEvent::Finished) | Err(RecvError::Closed) => break,
            Ok(PipelineEvent::Log(_) | PipelineEvent::Error(_)) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "progress listener fell behind");
            }
        }
    }
}

fn print_requeue(results: &[GalleryResult]) {
    let requeue = results
        .iter()
        .filter(|r| r.status.needs_attention())
        .collect::<Vec<_>>();
    if requeue.is_empty() {
        return;
    }
    eprintln!("SKUs to re-queue:");
    for result in &requeue {
        match &result.error {
            Some(error) => eprintln!("  {} [{}] {error}", result.sku, result.status.label()),
            None => eprintln!("  {} [{}]", result.sku, result.status.label()),
        }
    }
    let list = requeue
        .iter()
        .map(|r| r.sku.as_str())
        .collect::<Vec<_>>()
        .join(",");
    eprintln!("  --skus {list}");
}

fn review(cli: &Cli, args: &ReviewArgs) -> Result<ExitCode> {
    let store = open_store(cli)?;
    let mut service = CurationService::new(store);
    if let Some(path) = &args.report {
        service = service.with_last_run(&load_report(path)?);
    }
    let entries = service.review(&args.skus);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(ExitCode::SUCCESS);
    }
    for entry in &entries {
        print_entry(entry);
    }
    let attention = entries.iter().filter(|e| e.needs_attention()).count();
    eprintln!("{} SKUs listed, {attention} need attention", entries.len());
    Ok(ExitCode::SUCCESS)
}

fn print_entry(entry: &ReviewEntry) {
    let marker = if entry.needs_attention() { "!" } else { " " };
    let status = entry.last_status.map(|s| s.label()).unwrap_or("-");
    println!("{marker} {}  status={status}  images={}", entry.sku, entry.images.len());
    if let Some(error) = &entry.last_error {
        println!("    error: {error}");
    }
    for (index, url) in entry.images.iter().enumerate() {
        println!("    {:>2}. {url}", index + 1);
    }
}

fn curate(cli: &Cli, args: &CurateArgs) -> Result<ExitCode> {
    let decisions = match (&args.decisions, &args.sku) {
        (Some(path), _) => load_decisions(path)?,
        (None, Some(sku)) => {
            if args.keep.is_empty() && !args.drop_sku {
                return Err(HarvestError::Config(
                    "pass --keep URL for each image to keep, or --drop".to_string(),
                ));
            }
            vec![CurationDecision {
                sku: sku.clone(),
                kept_images: args.keep.iter().cloned().collect(),
                drop_sku: args.drop_sku,
            }]
        }
        (None, None) => {
            return Err(HarvestError::Config(
                "pass --sku or --decisions".to_string(),
            ));
        }
    };

    let service = CurationService::new(open_store(cli)?);
    let report = service.submit(&decisions)?;
    eprintln!(
        "curation applied: updated={} removed={} unchanged={} unknown={}",
        report.updated.len(),
        report.removed.len(),
        report.unchanged.len(),
        report.unknown.len()
    );
    if report.unknown.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("not in catalogue: {}", report.unknown.join(","));
        Ok(ExitCode::FAILURE)
    }
}
