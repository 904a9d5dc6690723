use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::task::{self, JoinSet};

use super::config::{PipelineConfig, sanitize_concurrency};
use super::error::{HarvestError, Result};
use super::runtime::{CancelSignal, EventBus, backoff_delay, sleep_or_cancel};
use super::types::{GalleryResult, GalleryStatus, PipelineEvent, SkuTask};

/// One attempt at harvesting a SKU's gallery.
pub trait GalleryScraper: Send + Sync + 'static {
    fn scrape(
        &self,
        task: &SkuTask,
        cancel: &CancelSignal,
        events: &EventBus,
    ) -> impl Future<Output = Result<GalleryResult>> + Send;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl From<&PipelineConfig> for RetryPolicy {
    fn from(cfg: &PipelineConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            backoff_base_ms: cfg.backoff_base_ms,
            backoff_max_ms: cfg.backoff_max_ms,
        }
    }
}

pub struct PipelineRunner<S> {
    scraper: Arc<S>,
    concurrency: usize,
    retry: RetryPolicy,
    cancel: CancelSignal,
    events: EventBus,
}

impl<S: GalleryScraper> PipelineRunner<S> {
    pub fn new(scraper: S, cfg: &PipelineConfig, cancel: CancelSignal, events: EventBus) -> Self {
        Self {
            scraper: Arc::new(scraper),
            concurrency: cfg.sanitized_concurrency(),
            retry: RetryPolicy::from(cfg),
            cancel,
            events,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = sanitize_concurrency(concurrency);
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Scrapes every SKU and returns one result per input, in input order.
    /// SKUs never started because of cancellation come back `Cancelled`.
    pub async fn run(&self, skus: &[String]) -> Vec<GalleryResult> {
        let total = skus.len();
        let mut slots: Vec<Option<GalleryResult>> = vec![None; total];
        let mut set: JoinSet<(usize, GalleryResult)> = JoinSet::new();
        let mut spawned: HashMap<task::Id, usize> = HashMap::new();
        let mut next = 0usize;
        let mut done = 0usize;
        let mut aborted = false;

        self.events.status(format!(
            "starting run: {total} SKUs, {} concurrent sessions",
            self.concurrency
        ));

        loop {
            while set.len() < self.concurrency && next < total && !self.cancel.is_cancelled() {
                let index = next;
                next += 1;
                let sku = skus[index].clone();
                let scraper = self.scraper.clone();
                let cancel = self.cancel.clone();
                let events = self.events.clone();
                let retry = self.retry;
                let handle = set.spawn(async move {
                    let result = scrape_with_retries(scraper, sku, retry, cancel, events).await;
                    (index, result)
                });
                spawned.insert(handle.id(), index);
            }

            let joined = tokio::select! {
                biased;
                joined = set.join_next() => joined,
                _ = self.cancel.cancelled(), if !aborted => {
                    // In-flight sessions are closed by their drop guards.
                    set.abort_all();
                    aborted = true;
                    continue;
                }
            };
            let Some(joined) = joined else {
                break;
            };
            match joined {
                Ok((index, result)) => {
                    done += 1;
                    tracing::debug!(
                        sku = %result.sku,
                        status = result.status.label(),
                        images = result.image_count(),
                        "[{done}/{total}] SKU finished"
                    );
                    self.events.emit(PipelineEvent::SkuFinished {
                        sku: result.sku.clone(),
                        status: result.status,
                        image_count: result.image_count(),
                    });
                    slots[index] = Some(result);
                }
                // A panic is a failure even when the run was cancelled meanwhile.
                Err(err) if err.is_panic() => {
                    self.events.error(format!("scrape worker failed: {err}"));
                    if let Some(&index) = spawned.get(&err.id()) {
                        done += 1;
                        let result =
                            GalleryResult::failed(skus[index].clone(), "scrape worker panicked");
                        self.events.emit(PipelineEvent::SkuFinished {
                            sku: result.sku.clone(),
                            status: result.status,
                            image_count: 0,
                        });
                        slots[index] = Some(result);
                    }
                }
                Err(err) if err.is_cancelled() => {}
                Err(err) => {
                    self.events.error(format!("scrape worker failed: {err}"));
                }
            }
        }

        if self.cancel.is_cancelled() && next < total {
            self.events
                .status(format!("run cancelled; {} SKUs not started", total - next));
        }

        let results = slots
            .into_iter()
            .zip(skus)
            .map(|(slot, sku)| match slot {
                Some(result) => result,
                None => {
                    let result = if self.cancel.is_cancelled() {
                        GalleryResult::cancelled(sku)
                    } else {
                        GalleryResult::failed(sku, "scrape worker panicked")
                    };
                    self.events.emit(PipelineEvent::SkuFinished {
                        sku: result.sku.clone(),
                        status: result.status,
                        image_count: 0,
                    });
                    result
                }
            })
            .collect::<Vec<_>>();
        self.events.emit(PipelineEvent::Finished);
        results
    }
}

enum Retry {
    Empty,
    Error(HarvestError),
}

async fn scrape_with_retries<S: GalleryScraper>(
    scraper: Arc<S>,
    sku: String,
    retry: RetryPolicy,
    cancel: CancelSignal,
    events: EventBus,
) -> GalleryResult {
    let mut task = SkuTask::new(sku);
    loop {
        if cancel.is_cancelled() {
            return GalleryResult::cancelled(task.sku);
        }

        let reason = match scraper.scrape(&task, &cancel, &events).await {
            Ok(result) if result.status == GalleryStatus::Empty => Retry::Empty,
            Ok(result) => return result,
            Err(HarvestError::Cancelled) => return GalleryResult::cancelled(task.sku),
            Err(err) if err.is_retryable() => Retry::Error(err),
            Err(err) => {
                events.error(format!("{}: {err}", task.sku));
                return GalleryResult::failed(task.sku, err.to_string());
            }
        };

        if task.attempt as usize > retry.max_retries {
            return match reason {
                Retry::Empty | Retry::Error(HarvestError::EmptyGallery { .. }) => {
                    GalleryResult::empty(task.sku)
                }
                Retry::Error(err) => {
                    events.error(format!("{}: giving up after {} attempts: {err}", task.sku, task.attempt));
                    GalleryResult::failed(task.sku, err.to_string())
                }
            };
        }

        let delay = backoff_delay(retry.backoff_base_ms, retry.backoff_max_ms, task.attempt);
        let why = match &reason {
            Retry::Empty => "empty gallery".to_string(),
            Retry::Error(err) => err.to_string(),
        };
        events.status(format!(
            "{}: attempt {} failed ({why}); retrying in {}ms",
            task.sku,
            task.attempt,
            delay.as_millis()
        ));
        if sleep_or_cancel(delay, &cancel).await.is_err() {
            return GalleryResult::cancelled(task.sku);
        }
        task.attempt += 1;
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub success: usize,
    pub empty: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub images: usize,
}

impl RunSummary {
    pub fn from_results(results: &[GalleryResult]) -> Self {
        let mut summary = RunSummary::default();
        for result in results {
            match result.status {
                GalleryStatus::Success => summary.success += 1,
                GalleryStatus::Empty => summary.empty += 1,
                GalleryStatus::Failed => summary.failed += 1,
                GalleryStatus::Cancelled => summary.cancelled += 1,
            }
            summary.images += result.image_count();
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::gallery::GalleryExtractor;
    use crate::app::gallery::tests::{ScriptedPage, fast_config};
    use crate::app::types::{ImageKind, ImageRef};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone)]
    enum Scripted {
        Images(usize),
        Empty,
        NavigationFailure,
        Broken,
        Panic,
    }

    struct FakeScraper {
        plan: HashMap<String, Scripted>,
        calls: Mutex<Vec<(String, u32)>>,
        jitter: bool,
        cancel_after_first: Option<CancelSignal>,
        finished: AtomicUsize,
    }

    impl FakeScraper {
        fn new(plan: &[(&str, Scripted)]) -> Self {
            Self {
                plan: plan
                    .iter()
                    .map(|(sku, s)| (sku.to_string(), s.clone()))
                    .collect(),
                calls: Mutex::new(Vec::new()),
                jitter: false,
                cancel_after_first: None,
                finished: AtomicUsize::new(0),
            }
        }

        fn attempts(&self, sku: &str) -> usize {
            self.calls
                .lock()
                .expect("calls")
                .iter()
                .filter(|(s, _)| s == sku)
                .count()
        }
    }

    /// Deterministic per-SKU latency in 0..25ms.
    fn latency_for(sku: &str) -> Duration {
        let seed = sku
            .bytes()
            .fold(0x811c_9dc5u32, |h, b| (h ^ b as u32).wrapping_mul(0x0100_0193));
        Duration::from_millis((seed % 25) as u64)
    }

    impl GalleryScraper for FakeScraper {
        async fn scrape(
            &self,
            task: &SkuTask,
            _cancel: &CancelSignal,
            _events: &EventBus,
        ) -> Result<GalleryResult> {
            self.calls
                .lock()
                .expect("calls")
                .push((task.sku.clone(), task.attempt));
            if self.jitter {
                tokio::time::sleep(latency_for(&task.sku)).await;
            }
            if self.finished.fetch_add(1, Ordering::SeqCst) == 0
                && let Some(cancel) = &self.cancel_after_first
            {
                cancel.cancel();
            }
            match self.plan.get(&task.sku).cloned().unwrap_or(Scripted::Images(1)) {
                Scripted::Images(n) => Ok(GalleryResult::success(
                    &task.sku,
                    (0..n)
                        .map(|i| ImageRef::new(format!("https://cdn.example/{}/{i}.jpg", task.sku), ImageKind::Gallery))
                        .collect(),
                )),
                Scripted::Empty => Ok(GalleryResult::empty(&task.sku)),
                Scripted::NavigationFailure => Err(HarvestError::Navigation {
                    sku: task.sku.clone(),
                    reason: "ready marker missing".to_string(),
                }),
                Scripted::Broken => Err(HarvestError::Config("selector exploded".to_string())),
                Scripted::Panic => panic!("gallery script crashed for {}", task.sku),
            }
        }
    }

    fn quick_config() -> PipelineConfig {
        PipelineConfig {
            product_url_template: "https://shop.example/p/{sku}".to_string(),
            max_retries: 2,
            backoff_base_ms: 1,
            backoff_max_ms: 4,
            ..PipelineConfig::default()
        }
    }

    fn skus(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn success_and_empty_are_reported_in_order() {
        let scraper = FakeScraper::new(&[
            ("AB1234-001", Scripted::Images(3)),
            ("CD5678-002", Scripted::Empty),
        ]);
        let runner = PipelineRunner::new(scraper, &quick_config(), CancelSignal::new(), EventBus::default());

        let results = runner.run(&skus(&["AB1234-001", "CD5678-002"])).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, GalleryStatus::Success);
        assert_eq!(results[0].image_count(), 3);
        assert_eq!(results[1].sku, "CD5678-002");
        assert_eq!(results[1].status, GalleryStatus::Empty);
        // one initial attempt plus two retries
        assert_eq!(runner.scraper.attempts("CD5678-002"), 3);
        assert_eq!(runner.scraper.attempts("AB1234-001"), 1);
    }

    #[tokio::test]
    async fn navigation_errors_retry_then_fail_without_aborting_batch() {
        let scraper = FakeScraper::new(&[
            ("NAV-1", Scripted::NavigationFailure),
            ("BROKEN-2", Scripted::Broken),
            ("OK-3", Scripted::Images(2)),
        ]);
        let runner = PipelineRunner::new(scraper, &quick_config(), CancelSignal::new(), EventBus::default());

        let results = runner.run(&skus(&["NAV-1", "BROKEN-2", "OK-3"])).await;
        assert_eq!(
            results.iter().map(|r| r.status).collect::<Vec<_>>(),
            vec![GalleryStatus::Failed, GalleryStatus::Failed, GalleryStatus::Success]
        );
        assert!(results[0].error.as_deref().unwrap_or_default().contains("ready marker"));
        assert_eq!(runner.scraper.attempts("NAV-1"), 3);
        // non-retryable errors are recorded on the first attempt
        assert_eq!(runner.scraper.attempts("BROKEN-2"), 1);
    }

    #[tokio::test]
    async fn output_order_matches_input_under_any_worker_count() {
        let input = (0..24).map(|i| format!("SKU-{i:03}")).collect::<Vec<_>>();
        for workers in [1, 2, 8] {
            let mut scraper = FakeScraper::new(&[]);
            scraper.jitter = true;
            let runner = PipelineRunner::new(scraper, &quick_config(), CancelSignal::new(), EventBus::default())
                .with_concurrency(workers);

            let results = runner.run(&input).await;
            let order = results.iter().map(|r| r.sku.clone()).collect::<Vec<_>>();
            assert_eq!(order, input, "workers={workers}");
            assert!(results.iter().all(|r| r.status == GalleryStatus::Success));
        }
    }

    #[tokio::test]
    async fn cancellation_after_first_sku_marks_the_rest_cancelled() {
        let cancel = CancelSignal::new();
        let mut scraper = FakeScraper::new(&[]);
        scraper.cancel_after_first = Some(cancel.clone());
        let runner = PipelineRunner::new(scraper, &quick_config(), cancel, EventBus::default())
            .with_concurrency(1);

        let input = skus(&["S1", "S2", "S3", "S4", "S5"]);
        let results = runner.run(&input).await;
        assert_eq!(results.len(), 5);
        assert_eq!(results[0].status, GalleryStatus::Success);
        assert!(results[1..].iter().all(|r| r.status == GalleryStatus::Cancelled));
        assert_eq!(
            results.iter().map(|r| r.sku.as_str()).collect::<Vec<_>>(),
            vec!["S1", "S2", "S3", "S4", "S5"]
        );
        assert_eq!(runner.scraper.calls.lock().expect("calls").len(), 1);
    }

    #[tokio::test]
    async fn worker_panicking_after_cancellation_is_recorded_failed() {
        let cancel = CancelSignal::new();
        let events = EventBus::new(64);
        let mut rx = events.subscribe();
        let mut scraper = FakeScraper::new(&[("S1", Scripted::Panic)]);
        scraper.cancel_after_first = Some(cancel.clone());
        let runner = PipelineRunner::new(scraper, &quick_config(), cancel, events)
            .with_concurrency(1);

        let results = runner.run(&skus(&["S1", "S2", "S3"])).await;
        assert_eq!(results[0].sku, "S1");
        assert_eq!(results[0].status, GalleryStatus::Failed);
        assert_eq!(results[0].error.as_deref(), Some("scrape worker panicked"));
        assert!(results[1..].iter().all(|r| r.status == GalleryStatus::Cancelled));

        let mut finished = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PipelineEvent::SkuFinished { sku, status, .. } = event {
                finished.push((sku, status));
            }
        }
        // exactly one progress event per SKU, the panic included
        assert_eq!(finished.len(), 3);
        assert!(finished.contains(&("S1".to_string(), GalleryStatus::Failed)));
    }

    #[tokio::test]
    async fn progress_event_is_emitted_per_sku() {
        let events = EventBus::new(64);
        let mut rx = events.subscribe();
        let scraper = FakeScraper::new(&[("A", Scripted::Images(2)), ("B", Scripted::Empty)]);
        let cfg = PipelineConfig {
            max_retries: 0,
            ..quick_config()
        };
        let runner = PipelineRunner::new(scraper, &cfg, CancelSignal::new(), events);
        runner.run(&skus(&["A", "B"])).await;

        let mut finished = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PipelineEvent::SkuFinished { sku, status, image_count } = event {
                finished.push((sku, status, image_count));
            }
        }
        finished.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            finished,
            vec![
                ("A".to_string(), GalleryStatus::Success, 2),
                ("B".to_string(), GalleryStatus::Empty, 0),
            ]
        );
    }

    /// Extractor-backed scraper over scripted pages, so the runner and the
    /// interaction sequence are exercised together.
    struct ScriptedPageScraper {
        extractor: GalleryExtractor,
    }

    impl GalleryScraper for ScriptedPageScraper {
        async fn scrape(
            &self,
            task: &SkuTask,
            cancel: &CancelSignal,
            events: &EventBus,
        ) -> Result<GalleryResult> {
            let base = format!("https://cdn.example/{}", task.sku);
            let page = ScriptedPage::new(
                Some(&format!("{base}/1.jpg")),
                &[&format!("{base}/1.jpg?v=9"), &format!("{base}/2.jpg"), &format!("{base}/3.jpg")],
            );
            self.extractor.extract(&page, &task.sku, cancel, events).await
        }
    }

    #[tokio::test]
    async fn rerunning_the_same_list_reproduces_the_same_images() {
        let cfg = fast_config();
        let make = || {
            PipelineRunner::new(
                ScriptedPageScraper {
                    extractor: GalleryExtractor::from_config(&cfg),
                },
                &cfg,
                CancelSignal::new(),
                EventBus::default(),
            )
            .with_concurrency(2)
        };
        let input = skus(&["AB1234-001", "CD5678-002"]);
        let first = make().run(&input).await;
        let second = make().run(&input).await;
        assert_eq!(first, second);
        assert!(first.iter().all(|r| r.image_count() == 3));
    }

    #[test]
    fn summary_counts_statuses() {
        let results = vec![
            GalleryResult::success("A", vec![ImageRef::new("https://x/a.jpg", ImageKind::Hero)]),
            GalleryResult::empty("B"),
            GalleryResult::failed("C", "boom"),
            GalleryResult::cancelled("D"),
        ];
        assert_eq!(
            RunSummary::from_results(&results),
            RunSummary {
                success: 1,
                empty: 1,
                failed: 1,
                cancelled: 1,
                images: 1
            }
        );
    }
}
