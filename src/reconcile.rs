#![forbid(unsafe_code)]

//! Reconciliation of the three views of a collection: what the remote
//! playlist lists right now, what the manifest remembers, and which media
//! files are actually on disk.
//!
//! Every remote entry receives exactly one [`Status`]. Manifest entries that
//! vanished upstream become [`Status::Deleted`] and files nobody remembers
//! become [`Status::Special`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::fetch::RemoteEntry;
use crate::manifest::{DownloadRecord, InfoEntry, ManifestRecord, normalize_url};
use crate::sanitize::{Charset, normalize_name, sanitize, title_safe};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Never downloaded; queued for download this run.
    Submitted,
    /// A submitted entry that finished downloading.
    Downloaded,
    /// File on disk but no manifest record.
    DataMissing,
    /// Manifest record but no file on disk.
    Missing,
    /// Manifest record whose video disappeared from the remote list.
    Deleted,
    Skipped,
    Ignored,
    /// File on disk nobody remembers.
    Special,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Submitted => "submitted",
            Status::Downloaded => "downloaded",
            Status::DataMissing => "data_missing",
            Status::Missing => "missing",
            Status::Deleted => "deleted",
            Status::Skipped => "skipped",
            Status::Ignored => "ignored",
            Status::Special => "special",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Adopt files found on disk into the manifest (`data_missing`).
    pub update: bool,
    /// Report manifest entries without a file as `missing`. When false they
    /// count as skipped, for mounts whose listings cannot be trusted.
    pub trust_missing: bool,
    /// Compare names in NFC form.
    pub normalize_unicode: bool,
    /// Collection-relative location recorded for adopted files.
    pub location: String,
    /// Normalized urls ignored for this run only, on top of the manifest's
    /// own ignore map.
    pub ignored: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryClassification {
    /// 1-based playlist position; the listing position when the engine
    /// reports none.
    pub index: usize,
    pub entry: RemoteEntry,
    pub status: Status,
    pub existing_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedEntry {
    pub url: String,
    pub info: InfoEntry,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub entries: Vec<EntryClassification>,
    pub deleted: Vec<DeletedEntry>,
    pub special: Vec<String>,
}

impl Classification {
    pub fn counts(&self) -> BTreeMap<Status, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.entries {
            *counts.entry(entry.status).or_insert(0) += 1;
        }
        if !self.deleted.is_empty() {
            counts.insert(Status::Deleted, self.deleted.len());
        }
        if !self.special.is_empty() {
            counts.insert(Status::Special, self.special.len());
        }
        counts
    }

    pub fn with_status(&self, status: Status) -> impl Iterator<Item = &EntryClassification> {
        self.entries.iter().filter(move |entry| entry.status == status)
    }

    /// Manifest records for files that exist on disk but were never recorded.
    pub fn adoptions(&self, location: &str) -> Vec<DownloadRecord> {
        self.with_status(Status::DataMissing)
            .filter_map(|entry| {
                entry.existing_file.as_ref().map(|file| DownloadRecord {
                    url: entry.entry.url.clone(),
                    title: entry.entry.title.clone(),
                    location: location.to_string(),
                    file: file.clone(),
                })
            })
            .collect()
    }
}

struct DiskName<'a> {
    original: &'a str,
    normalized: String,
}

/// Pure classification; never touches the manifest.
pub fn classify(
    manifest: &ManifestRecord,
    entries: &[RemoteEntry],
    on_disk: &[String],
    options: &ReconcileOptions,
) -> Classification {
    let normalize = options.normalize_unicode;
    let disk: Vec<DiskName<'_>> = on_disk
        .iter()
        .map(|name| DiskName {
            original: name,
            normalized: normalize_name(name, normalize).into_owned(),
        })
        .collect();

    let mut remote_urls = BTreeSet::new();
    let mut classified = Vec::with_capacity(entries.len());

    for (position, entry) in entries.iter().enumerate() {
        let url = normalize_url(&entry.url);
        remote_urls.insert(url.clone());

        let (status, existing_file) = if entry.view_count.is_none() {
            (Status::Skipped, None)
        } else if manifest.ignore.contains_key(&url) || options.ignored.contains(&url) {
            (Status::Ignored, None)
        } else {
            let existing = find_existing_file(&disk, entry, manifest.info.get(&url), normalize);
            let in_manifest = manifest.downloaded.contains(&url);
            let status = match (existing.is_some(), in_manifest) {
                (false, false) => Status::Submitted,
                (true, false) => Status::DataMissing,
                (false, true) if options.trust_missing => Status::Missing,
                (false, true) => Status::Skipped,
                (true, true) => Status::Skipped,
            };
            (status, existing)
        };

        classified.push(EntryClassification {
            index: entry.playlist_index.unwrap_or(position + 1),
            entry: entry.clone(),
            status,
            existing_file,
        });
    }

    let deleted = manifest
        .info
        .iter()
        .filter(|(url, _)| !remote_urls.contains(url.as_str()))
        .map(|(url, info)| DeletedEntry {
            url: url.clone(),
            info: info.clone(),
        })
        .collect();

    let known_files: BTreeSet<String> = manifest
        .info
        .values()
        .map(|info| normalize_name(&info.file, normalize).into_owned())
        .collect();
    let special = disk
        .iter()
        .filter(|name| !known_files.contains(&name.normalized))
        .map(|name| name.original.to_string())
        .collect();

    Classification {
        entries: classified,
        deleted,
        special,
    }
}

/// Classifies and, in update mode, records `data_missing` files in the
/// manifest right away.
pub fn reconcile(
    manifest: &mut ManifestRecord,
    entries: &[RemoteEntry],
    on_disk: &[String],
    options: &ReconcileOptions,
) -> Classification {
    let classification = classify(manifest, entries, on_disk, options);
    if options.update {
        for record in classification.adoptions(&options.location) {
            tracing::debug!(url = %record.url, file = %record.file, "adopting file into manifest");
            manifest.record_download(record);
        }
    }
    classification
}

/// First disk file containing the sanitized title. The manifest's own record
/// for the url also counts, which keeps renamed uploads matched.
fn find_existing_file(
    disk: &[DiskName<'_>],
    entry: &RemoteEntry,
    recorded: Option<&InfoEntry>,
    normalize: bool,
) -> Option<String> {
    let candidates = [
        title_safe(&entry.title, Charset::Current),
        sanitize(&entry.title, Charset::Current),
    ];
    for candidate in candidates {
        if candidate.trim().is_empty() {
            continue;
        }
        let needle = normalize_name(&candidate, normalize);
        if let Some(found) = disk.iter().find(|name| name.normalized.contains(needle.as_ref())) {
            return Some(found.original.to_string());
        }
    }

    let recorded = recorded?;
    let recorded_name = normalize_name(&recorded.file, normalize);
    disk.iter()
        .find(|name| name.normalized == recorded_name.as_ref())
        .map(|name| name.original.to_string())
}
