use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use super::error::{HarvestError, Result};
use super::types::{CurationDecision, GalleryResult, GalleryStatus, ImageKind, ImageRef, sku_key};

const REPORT_HEADERS: [&str; 5] = ["sku", "status", "image_count", "error", "images"];

/// Splits on newlines and commas, trims, drops blanks and repeats (by
/// catalogue key, first spelling wins). Order is preserved.
pub fn parse_sku_list(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.split(['\n', ','])
        .map(str::trim)
        .filter(|sku| !sku.is_empty())
        .filter(|sku| seen.insert(sku_key(sku)))
        .map(ToString::to_string)
        .collect()
}

/// SKUs from `--skus`, or from a file, or from stdin when the file is `-`.
pub fn read_sku_input(inline: Option<&str>, file: Option<&Path>) -> Result<Vec<String>> {
    let text = match (inline, file) {
        (Some(list), _) => list.to_string(),
        (None, Some(path)) if path.as_os_str() == "-" => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            buf
        }
        (None, Some(path)) => fs::read_to_string(path)?,
        (None, None) => {
            return Err(HarvestError::Config(
                "no SKUs given; use --skus or --skus-file".to_string(),
            ));
        }
    };
    Ok(parse_sku_list(&text))
}

pub fn load_decisions(path: &Path) -> Result<Vec<CurationDecision>> {
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&content)?)
}

/// Per-SKU CSV run report.
pub struct ReportSink {
    writer: csv::Writer<File>,
}

impl ReportSink {
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(REPORT_HEADERS)?;
        Ok(Self { writer })
    }

    pub fn write_result(&mut self, result: &GalleryResult) -> Result<()> {
        self.writer.write_record([
            result.sku.clone(),
            result.status.label().to_string(),
            result.image_count().to_string(),
            result.error.clone().unwrap_or_default(),
            result.image_urls().join("|"),
        ])?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

pub fn write_report(path: &Path, results: &[GalleryResult]) -> Result<()> {
    let mut sink = ReportSink::new(path)?;
    for result in results {
        sink.write_result(result)?;
    }
    sink.flush()
}

/// Reads a run report back. Column order does not matter; rows without a
/// SKU or with an unknown status are skipped.
pub fn load_report(path: &Path) -> Result<Vec<GalleryResult>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let mut index = HashMap::<String, usize>::new();
    for (idx, header) in headers.iter().enumerate() {
        index.insert(header.trim().to_ascii_lowercase(), idx);
    }

    let mut results = Vec::new();
    for record in reader.records() {
        let record = record?;
        let get = |name: &str| {
            index
                .get(name)
                .and_then(|idx| record.get(*idx))
                .unwrap_or_default()
        };

        let sku = get("sku").trim();
        if sku.is_empty() {
            continue;
        }
        let Some(status) = GalleryStatus::from_label(get("status")) else {
            tracing::debug!(sku, status = get("status"), "skipping report row");
            continue;
        };
        let images = get("images")
            .split('|')
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(|url| ImageRef::new(url, ImageKind::Unknown))
            .collect::<Vec<_>>();
        let error = Some(get("error").trim())
            .filter(|e| !e.is_empty())
            .map(ToString::to_string);
        results.push(GalleryResult {
            sku: sku.to_string(),
            images,
            status,
            error,
        });
    }
    Ok(results)
}
