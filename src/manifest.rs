#![forbid(unsafe_code)]

//! Durable per-collection record of what has been downloaded.
//!
//! Two files live under the data directory for every collection:
//!
//! * `<name>.yml` holds the full [`ManifestRecord`].
//! * `<name>.txt` is a yt-dlp style archive (`youtube <id>` per line) that the
//!   fetch engine consumes as its skip list.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::{self, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::persist::{read_yaml, write_atomic, write_yaml};

/// Tag written in front of every archive id, matching yt-dlp's extractor key.
pub const ARCHIVE_SOURCE_TAG: &str = "youtube";

/// Ignore reason given to downloads recorded before file info was tracked.
pub const UNTRACKED_REASON: &str = "downloaded without file info";

/// Where a downloaded video ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoEntry {
    pub title: String,
    /// Collection-relative directory, e.g. `music/Favourites`.
    pub location: String,
    /// Basename of the media file inside `location`.
    pub file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    #[serde(default, deserialize_with = "url_set")]
    pub downloaded: BTreeSet<String>,
    #[serde(default)]
    pub info: BTreeMap<String, InfoEntry>,
    /// Explicit user overrides, url -> reason. Never reconciled.
    #[serde(default)]
    pub ignore: BTreeMap<String, String>,
}

/// Reads `downloaded` either as a list or as the `!!set` mapping (keys with
/// null values) that older manifests were written with.
fn url_set<'de, D>(deserializer: D) -> std::result::Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct UrlSet;

    impl<'de> Visitor<'de> for UrlSet {
        type Value = BTreeSet<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a list or set of urls")
        }

        fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(BTreeSet::new())
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error> {
            let mut urls = BTreeSet::new();
            while let Some(url) = seq.next_element::<String>()? {
                urls.insert(url);
            }
            Ok(urls)
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
            let mut urls = BTreeSet::new();
            while let Some((url, IgnoredAny)) = map.next_entry::<String, IgnoredAny>()? {
                urls.insert(url);
            }
            Ok(urls)
        }
    }

    deserializer.deserialize_any(UrlSet)
}

/// A finished (or adopted) download to fold into the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub url: String,
    pub title: String,
    pub location: String,
    pub file: String,
}

impl ManifestRecord {
    /// Inserts or overwrites the record for `record.url` (normalized).
    pub fn record_download(&mut self, record: DownloadRecord) {
        let url = normalize_url(&record.url);
        self.downloaded.insert(url.clone());
        self.info.insert(
            url,
            InfoEntry {
                title: record.title,
                location: record.location,
                file: record.file,
            },
        );
    }

    pub fn is_downloaded(&self, url: &str) -> bool {
        self.downloaded.contains(&normalize_url(url))
    }

    pub fn is_ignored(&self, url: &str) -> bool {
        self.ignore.contains_key(&normalize_url(url))
    }

    /// Adds an ignore override unless the url already carries one.
    pub fn ignore_url(&mut self, url: &str, reason: &str) {
        self.ignore
            .entry(normalize_url(url))
            .or_insert_with(|| reason.to_string());
    }

    /// Archive ids for `downloaded ∪ ignore`, deduplicated and sorted.
    pub fn archive_ids(&self) -> BTreeSet<String> {
        self.downloaded
            .iter()
            .chain(self.ignore.keys())
            .map(|url| archive_id(url))
            .collect()
    }

    /// Repairs entries loaded from older files: urls are normalized and
    /// downloaded urls without an info entry move to the ignore map, which
    /// keeps them out of the download queue and inside the archive.
    fn canonicalize(self) -> (Self, usize) {
        let info: BTreeMap<String, InfoEntry> = self
            .info
            .into_iter()
            .map(|(url, entry)| (normalize_url(&url), entry))
            .collect();
        let mut ignore: BTreeMap<String, String> = self
            .ignore
            .into_iter()
            .map(|(url, reason)| (normalize_url(&url), reason))
            .collect();
        let mut downloaded = BTreeSet::new();
        let mut moved = 0;
        for url in self.downloaded {
            let url = normalize_url(&url);
            if info.contains_key(&url) {
                downloaded.insert(url);
            } else {
                moved += 1;
                ignore
                    .entry(url)
                    .or_insert_with(|| UNTRACKED_REASON.to_string());
            }
        }
        (
            Self {
                downloaded,
                info,
                ignore,
            },
            moved,
        )
    }
}

/// Canonical url form used as manifest key.
pub fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();
    match trimmed.strip_prefix("https://www.") {
        Some(rest) => format!("https://{rest}"),
        None => trimmed.to_string(),
    }
}

/// Derives the id yt-dlp writes to its archive from a video url.
pub fn archive_id(url: &str) -> String {
    let url = normalize_url(url);
    if let Some((_, query)) = url.split_once('?') {
        for pair in query.split('&') {
            if let Some(id) = pair.strip_prefix("v=")
                && !id.is_empty()
            {
                return id.to_string();
            }
        }
    }
    let path = url.split(['?', '#']).next().unwrap_or(&url);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
        .to_string()
}

/// Loads and saves manifests inside one data directory.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    data_dir: PathBuf,
}

impl ManifestStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn record_path(&self, collection: &str) -> PathBuf {
        self.data_dir.join(format!("{collection}.yml"))
    }

    pub fn archive_path(&self, collection: &str) -> PathBuf {
        self.data_dir.join(format!("{collection}.txt"))
    }

    /// Returns the stored record, or an empty one when nothing was saved yet.
    /// A file that exists but cannot be parsed is an error.
    pub fn load(&self, collection: &str) -> Result<ManifestRecord> {
        let path = self.record_path(collection);
        let record: Option<ManifestRecord> =
            read_yaml(&path).with_context(|| format!("loading manifest for {collection}"))?;
        let Some(record) = record else {
            return Ok(ManifestRecord::default());
        };
        let (record, moved) = record.canonicalize();
        if moved > 0 {
            tracing::warn!(
                collection,
                moved,
                "manifest listed downloads without file info; moved them to the ignore list"
            );
        }
        Ok(record)
    }

    /// Persists the record and, when asked, the flat archive next to it.
    pub fn save(&self, collection: &str, record: &ManifestRecord, include_archive: bool) -> Result<()> {
        let path = self.record_path(collection);
        write_yaml(&path, record).with_context(|| format!("saving manifest for {collection}"))?;
        if include_archive {
            let mut lines = String::new();
            for id in record.archive_ids() {
                lines.push_str(ARCHIVE_SOURCE_TAG);
                lines.push(' ');
                lines.push_str(&id);
                lines.push('\n');
            }
            let archive = self.archive_path(collection);
            write_atomic(&archive, lines.as_bytes())
                .with_context(|| format!("saving archive for {collection}"))?;
        }
        Ok(())
    }
}
