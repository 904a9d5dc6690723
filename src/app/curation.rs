use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;

use super::catalogue::{CatalogueStore, CurationOutcome};
use super::error::{HarvestError, Result};
use super::types::{CurationDecision, GalleryResult, GalleryStatus, sku_key};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewEntry {
    pub sku: String,
    pub images: Vec<String>,
    /// Status from the most recent run report, when one was supplied.
    pub last_status: Option<GalleryStatus>,
    pub last_error: Option<String>,
}

impl ReviewEntry {
    pub fn needs_attention(&self) -> bool {
        self.images.is_empty() || self.last_status.is_some_and(GalleryStatus::needs_attention)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CurationReport {
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
    pub unknown: Vec<String>,
}

/// Review and write-back over the catalogue. Decisions are applied one SKU
/// at a time, each through the store's own persist.
pub struct CurationService {
    store: Arc<CatalogueStore>,
    last_run: HashMap<String, (GalleryStatus, Option<String>)>,
}

impl CurationService {
    pub fn new(store: Arc<CatalogueStore>) -> Self {
        Self {
            store,
            last_run: HashMap::new(),
        }
    }

    /// Attaches run outcomes so SKUs that failed or came back empty are
    /// listed even without a catalogue entry.
    pub fn with_last_run(mut self, results: &[GalleryResult]) -> Self {
        for result in results {
            self.last_run
                .insert(sku_key(&result.sku), (result.status, result.error.clone()));
        }
        self
    }

    /// Entries sorted by SKU. An empty filter means everything.
    pub fn review(&self, filter: &[String]) -> Vec<ReviewEntry> {
        let wanted = filter.iter().map(|sku| sku_key(sku)).collect::<Vec<_>>();
        let keep = |sku: &str| wanted.is_empty() || wanted.iter().any(|w| w == sku);

        let mut rows = BTreeMap::<String, ReviewEntry>::new();
        for (sku, images) in self.store.snapshot() {
            if !keep(&sku) {
                continue;
            }
            let (last_status, last_error) = self.last_outcome(&sku);
            rows.insert(
                sku.clone(),
                ReviewEntry {
                    sku,
                    images,
                    last_status,
                    last_error,
                },
            );
        }
        for (sku, (status, error)) in &self.last_run {
            if !keep(sku) || rows.contains_key(sku) {
                continue;
            }
            rows.insert(
                sku.clone(),
                ReviewEntry {
                    sku: sku.clone(),
                    images: Vec::new(),
                    last_status: Some(*status),
                    last_error: error.clone(),
                },
            );
        }
        for sku in &wanted {
            if !rows.contains_key(sku) {
                rows.insert(
                    sku.clone(),
                    ReviewEntry {
                        sku: sku.clone(),
                        images: Vec::new(),
                        last_status: None,
                        last_error: None,
                    },
                );
            }
        }
        rows.into_values().collect()
    }

    /// Applies every decision in order. Decisions for SKUs not in the
    /// catalogue are collected in `unknown`; a persistence failure stops the
    /// batch, leaving earlier decisions committed.
    pub fn submit(&self, decisions: &[CurationDecision]) -> Result<CurationReport> {
        let mut report = CurationReport::default();
        for decision in decisions {
            let key = sku_key(&decision.sku);
            match self.store.apply_curation(decision) {
                Ok(CurationOutcome::Updated { .. }) => report.updated.push(key),
                Ok(CurationOutcome::Removed) => report.removed.push(key),
                Ok(CurationOutcome::Unchanged) => report.unchanged.push(key),
                Err(HarvestError::UnknownSku(_)) => {
                    tracing::warn!(sku = %key, "decision for SKU not in catalogue");
                    report.unknown.push(key);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(report)
    }

    fn last_outcome(&self, sku: &str) -> (Option<GalleryStatus>, Option<String>) {
        match self.last_run.get(sku) {
            Some((status, error)) => (Some(*status), error.clone()),
            None => (None, None),
        }
    }
}
