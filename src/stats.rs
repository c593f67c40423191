#![forbid(unsafe_code)]

//! Per-collection and global bookkeeping of reconciliation and download
//! results, and the YAML reports written at the end of a run.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::persist::write_yaml;
use crate::reconcile::{Classification, Status};

pub const FAILED_KEY: &str = "failed";

/// One entry as listed for operator review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatRecord {
    pub url: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub url: String,
    pub title: String,
    pub location: String,
    pub error: String,
    /// 1-based position in the remote listing.
    pub index: usize,
}

/// How a finished download is labelled in `results.yml`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    Downloaded,
    /// Audio-only collections.
    Music,
}

/// One successful download of this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadResult {
    pub status: ResultStatus,
    pub title: String,
    pub file: String,
    pub location: String,
    pub url: String,
}

/// Summary numbers for one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionReport {
    pub downloaded: usize,
    pub failed: usize,
    /// Submitted this run but not downloaded.
    pub remaining: usize,
    pub total: usize,
    pub existing_files: usize,
    /// Files nobody remembers (`special`).
    pub anomaly: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionStats {
    #[serde(skip)]
    pub name: String,
    pub counts: BTreeMap<&'static str, usize>,
    #[serde(flatten)]
    pub report: CollectionReport,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub submitted: Vec<StatRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<StatRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub data_missing: Vec<StatRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deleted: Vec<StatRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ignored: Vec<StatRecord>,
    #[serde(skip)]
    pub special: Vec<String>,
    #[serde(skip)]
    pub failures: Vec<FailedItem>,
    #[serde(skip)]
    pub results: Vec<DownloadResult>,
    /// Work submitted to the download pool this run.
    #[serde(skip)]
    pub queued: usize,
}

impl CollectionStats {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn from_classification(
        name: impl Into<String>,
        classification: &Classification,
        existing_files: usize,
    ) -> Self {
        let mut stats = Self::new(name);
        for (status, count) in classification.counts() {
            stats.counts.insert(status.as_str(), count);
        }
        for entry in &classification.entries {
            let record = StatRecord {
                url: entry.entry.url.clone(),
                title: entry.entry.title.clone(),
                file: entry.existing_file.clone(),
            };
            match entry.status {
                Status::Submitted => stats.submitted.push(record),
                Status::Missing => stats.missing.push(record),
                Status::DataMissing => stats.data_missing.push(record),
                Status::Ignored => stats.ignored.push(record),
                _ => {}
            }
        }
        stats.deleted = classification
            .deleted
            .iter()
            .map(|deleted| StatRecord {
                url: deleted.url.clone(),
                title: deleted.info.title.clone(),
                file: Some(deleted.info.file.clone()),
            })
            .collect();
        stats.special = classification.special.clone();
        stats.report.total = classification.entries.len();
        stats.report.existing_files = existing_files;
        stats.report.anomaly = classification.special.len();
        stats
    }

    fn bump(&mut self, key: &'static str) {
        *self.counts.entry(key).or_insert(0) += 1;
    }

    pub fn record_queued(&mut self) {
        self.queued += 1;
        self.refresh_remaining();
    }

    pub fn record_downloaded(&mut self, result: DownloadResult) {
        self.results.push(result);
        self.report.downloaded += 1;
        self.bump(Status::Downloaded.as_str());
        self.refresh_remaining();
    }

    /// A queued entry turned out to be on disk already.
    pub fn record_skipped(&mut self) {
        self.bump(Status::Skipped.as_str());
    }

    pub fn record_failure(&mut self, item: FailedItem) {
        self.report.failed += 1;
        self.bump(FAILED_KEY);
        self.failures.push(item);
    }

    fn refresh_remaining(&mut self) {
        self.report.remaining = self.queued.saturating_sub(self.report.downloaded);
    }
}

/// Where the end-of-run reports go. `None` disables a report.
#[derive(Debug, Clone, Default)]
pub struct ReportPaths {
    pub stats: Option<PathBuf>,
    pub special: Option<PathBuf>,
    pub failed: Option<PathBuf>,
    pub missing: Option<PathBuf>,
    pub results: Option<PathBuf>,
}

#[derive(Serialize)]
struct StatsDocument<'a> {
    global: GlobalSection,
    collections: BTreeMap<&'a str, &'a CollectionStats>,
}

#[derive(Serialize)]
struct GlobalSection {
    #[serde(flatten)]
    totals: BTreeMap<&'static str, usize>,
    report: CollectionReport,
}

#[derive(Debug, Default)]
pub struct StatsAggregator {
    collections: Vec<CollectionStats>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, stats: CollectionStats) {
        self.collections.push(stats);
    }

    pub fn collections(&self) -> &[CollectionStats] {
        &self.collections
    }

    /// Sum of every counter across collections, keeping non-zero totals only.
    pub fn global_totals(&self) -> BTreeMap<&'static str, usize> {
        let mut totals = BTreeMap::new();
        for stats in &self.collections {
            for (key, count) in &stats.counts {
                *totals.entry(*key).or_insert(0) += count;
            }
        }
        totals.retain(|_, count| *count > 0);
        totals
    }

    pub fn global_report(&self) -> CollectionReport {
        self.collections
            .iter()
            .fold(CollectionReport::default(), |mut acc, stats| {
                acc.downloaded += stats.report.downloaded;
                acc.failed += stats.report.failed;
                acc.remaining += stats.report.remaining;
                acc.total += stats.report.total;
                acc.existing_files += stats.report.existing_files;
                acc.anomaly += stats.report.anomaly;
                acc
            })
    }

    fn per_collection<T: Clone>(&self, pick: impl Fn(&CollectionStats) -> &[T]) -> BTreeMap<&str, Vec<T>> {
        self.collections
            .iter()
            .filter(|stats| !pick(stats).is_empty())
            .map(|stats| (stats.name.as_str(), pick(stats).to_vec()))
            .collect()
    }

    pub fn special_files(&self) -> BTreeMap<&str, Vec<String>> {
        self.per_collection(|stats| stats.special.as_slice())
    }

    pub fn failed_items(&self) -> BTreeMap<&str, Vec<FailedItem>> {
        self.per_collection(|stats| stats.failures.as_slice())
    }

    pub fn missing_records(&self) -> BTreeMap<&str, Vec<StatRecord>> {
        self.per_collection(|stats| stats.missing.as_slice())
    }

    /// Downloads of this run per collection; collections without any keep
    /// an empty list.
    pub fn download_results(&self) -> BTreeMap<&str, &[DownloadResult]> {
        self.collections
            .iter()
            .map(|stats| (stats.name.as_str(), stats.results.as_slice()))
            .collect()
    }

    /// Writes every configured report. `special.yml` is only written when
    /// orphans were found.
    pub fn write_reports(&self, paths: &ReportPaths) -> Result<()> {
        if let Some(path) = &paths.stats {
            let document = StatsDocument {
                global: GlobalSection {
                    totals: self.global_totals(),
                    report: self.global_report(),
                },
                collections: self
                    .collections
                    .iter()
                    .map(|stats| (stats.name.as_str(), stats))
                    .collect(),
            };
            write_yaml(path, &document).context("writing stats report")?;
        }
        if let Some(path) = &paths.special {
            let special = self.special_files();
            if !special.is_empty() {
                write_yaml(path, &special).context("writing special files report")?;
            }
        }
        if let Some(path) = &paths.failed {
            write_yaml(path, &self.failed_items()).context("writing failed report")?;
        }
        if let Some(path) = &paths.missing {
            write_yaml(path, &self.missing_records()).context("writing missing report")?;
        }
        if let Some(path) = &paths.results {
            write_yaml(path, &self.download_results()).context("writing results report")?;
        }
        Ok(())
    }

    /// One line per collection plus the global totals.
    pub fn log_summary(&self, verbose: bool) {
        for stats in &self.collections {
            let report = &stats.report;
            tracing::info!(
                collection = %stats.name,
                total = report.total,
                downloaded = report.downloaded,
                failed = report.failed,
                remaining = report.remaining,
                existing = report.existing_files,
                anomaly = report.anomaly,
                "collection summary"
            );
            if verbose {
                let listings = [
                    ("submitted", &stats.submitted),
                    ("missing", &stats.missing),
                    ("data_missing", &stats.data_missing),
                    ("deleted", &stats.deleted),
                ];
                for (label, records) in listings {
                    for record in records {
                        tracing::info!(collection = %stats.name, url = %record.url, "{label}: {}", record.title);
                    }
                }
                for failure in &stats.failures {
                    tracing::info!(collection = %stats.name, url = %failure.url, "failed: {} ({})", failure.title, failure.error);
                }
                for file in &stats.special {
                    tracing::info!(collection = %stats.name, "special: {file}");
                }
            }
        }
        let totals = self.global_totals();
        let rendered: Vec<String> = totals.iter().map(|(key, count)| format!("{key}={count}")).collect();
        tracing::info!("totals: {}", rendered.join(" "));
    }
}
