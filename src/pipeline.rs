#![forbid(unsafe_code)]

//! Drives one run over every configured collection: list, reconcile,
//! download what is new, merge, and keep the manifest current.
//!
//! Collections are handled one after another. Inside a collection a small
//! pool of workers downloads submitted entries; completions are folded into
//! the manifest by a single writer and saved right away.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::config::{CollectionConfig, IgnoreEntry};
use crate::fetch::{FetchEngine, FetchError, RemoteEntry, StreamKind, VideoDetails};
use crate::manifest::{DownloadRecord, ManifestRecord, ManifestStore, archive_id, normalize_url};
use crate::mux::{self, CAPTION_PREFERENCE, MediaMetadata, MediaMuxer, MergeInputs, MuxError, sidecar_path};
use crate::progress::{NoopObserver, ProgressObserver};
use crate::reconcile::{Classification, ReconcileOptions, Status, reconcile};
use crate::sanitize::{Charset, sanitize, title_safe};
use crate::stats::{CollectionStats, DownloadResult, FailedItem, ResultStatus, StatsAggregator};

const MEDIA_EXTENSIONS: [&str; 2] = ["mp4", "m4a"];

/// What a run does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Reconcile and report, never download.
    StatsOnly,
    /// Download new entries, trusting the engine's archive. No drift report.
    DownloadOnly,
    Both,
}

impl RunMode {
    pub fn from_flags(download: bool, stats: bool) -> Self {
        match (download, stats) {
            (true, true) => RunMode::Both,
            (true, false) => RunMode::DownloadOnly,
            (false, _) => RunMode::StatsOnly,
        }
    }

    pub fn downloads(self) -> bool {
        matches!(self, RunMode::DownloadOnly | RunMode::Both)
    }

    pub fn reconciles(self) -> bool {
        matches!(self, RunMode::StatsOnly | RunMode::Both)
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub media_root: PathBuf,
    /// Scratch space for intermediates; every item gets its own subdirectory.
    pub work_dir: PathBuf,
    pub mode: RunMode,
    /// Adopt files found on disk into the manifest.
    pub update: bool,
    pub trust_missing: bool,
    pub normalize_unicode: bool,
    pub workers: usize,
    /// Cap on entries submitted for download across the whole run.
    pub max_submitted: usize,
    /// Extra attempts after a transient failure.
    pub retries: u32,
    /// Pause after every item.
    pub throttle: Duration,
}

#[derive(Debug)]
pub struct RunSummary {
    pub stats: StatsAggregator,
    pub interrupted: bool,
    pub cap_reached: bool,
    pub submitted: usize,
}

pub struct Archiver {
    engine: Arc<dyn FetchEngine>,
    muxer: Arc<dyn MediaMuxer>,
    observer: Arc<dyn ProgressObserver>,
    store: ManifestStore,
    options: ArchiveOptions,
    cancel: CancellationToken,
    submitted: AtomicUsize,
}

struct CollectionOutcome {
    stats: CollectionStats,
    cap_reached: bool,
}

impl Archiver {
    pub fn new(
        engine: Arc<dyn FetchEngine>,
        muxer: Arc<dyn MediaMuxer>,
        store: ManifestStore,
        options: ArchiveOptions,
    ) -> Self {
        Self {
            engine,
            muxer,
            observer: Arc::new(NoopObserver),
            store,
            options,
            cancel: CancellationToken::new(),
            submitted: AtomicUsize::new(0),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Processes every collection in order. A collection that fails is
    /// logged and skipped; the run goes on with the next one.
    pub async fn run(&self, collections: &[CollectionConfig], ignore: &[IgnoreEntry]) -> RunSummary {
        let mut stats = StatsAggregator::new();
        let mut cap_reached = false;
        let ignored: BTreeSet<String> = ignore.iter().map(|entry| normalize_url(&entry.url)).collect();

        for (position, collection) in collections.iter().enumerate() {
            if self.cancel.is_cancelled() {
                tracing::warn!("interrupted; {} collections left unprocessed", collections.len() - position);
                break;
            }
            tracing::info!(
                collection = %collection.name,
                "processing #{} of {}",
                position + 1,
                collections.len()
            );
            match self.process_collection(collection, &ignored, cap_reached).await {
                Ok(outcome) => {
                    cap_reached |= outcome.cap_reached;
                    stats.add(outcome.stats);
                }
                Err(err) => {
                    tracing::warn!(collection = %collection.name, "skipping collection: {err:#}");
                }
            }
        }

        RunSummary {
            stats,
            interrupted: self.cancel.is_cancelled(),
            cap_reached,
            submitted: self.submitted.load(Ordering::Relaxed),
        }
    }

    async fn process_collection(
        &self,
        collection: &CollectionConfig,
        ignored: &BTreeSet<String>,
        cap_reached: bool,
    ) -> Result<CollectionOutcome> {
        let name = collection.name.as_str();
        let mode = self.options.mode;
        let mut manifest = self.store.load(name)?;
        let snapshot = manifest.clone();

        let archive = (!mode.reconciles()).then(|| self.store.archive_path(name));
        let Listing { entries, complete } = self.list_entries(collection.listing_url(), archive).await?;
        if self.cancel.is_cancelled() {
            bail!("interrupted while listing");
        }

        let output_dir = collection.output_dir(&self.options.media_root);
        let on_disk = scan_media_files(&output_dir)?;
        tracing::info!(
            collection = name,
            entries = entries.len(),
            existing = on_disk.len(),
            "listing complete (outpath: {})",
            output_dir.display()
        );

        let location = collection.relative_location();
        let reconcile_options = ReconcileOptions {
            update: self.options.update,
            trust_missing: self.options.trust_missing,
            normalize_unicode: self.options.normalize_unicode,
            location: location.clone(),
            ignored: ignored.clone(),
        };
        let mut classification = reconcile(&mut manifest, &entries, &on_disk, &reconcile_options);
        if !mode.reconciles() {
            // An archive-filtered listing says nothing about deletions.
            classification.deleted.clear();
            classification.special.clear();
        } else if !complete {
            tracing::warn!(
                collection = name,
                "listing is incomplete; {} possible deletions not reported",
                classification.deleted.len()
            );
            classification.deleted.clear();
        }
        let mut stats = CollectionStats::from_classification(name, &classification, on_disk.len());

        let writer = ManifestWriter {
            store: self.store.clone(),
            name: name.to_string(),
            record: Mutex::new(manifest),
        };

        let mut outcome_cap = cap_reached;
        if mode.downloads() {
            migrate_legacy_sidecars(&output_dir, &classification);
            if cap_reached {
                tracing::info!(collection = name, "submission cap reached; not downloading");
            } else {
                let context = Arc::new(JobContext {
                    engine: Arc::clone(&self.engine),
                    muxer: Arc::clone(&self.muxer),
                    observer: Arc::clone(&self.observer),
                    collection: collection.clone(),
                    output_dir: output_dir.clone(),
                    work_dir: self.options.work_dir.clone(),
                    location,
                    index_width: index_width(&entries),
                    retries: self.options.retries,
                    throttle: self.options.throttle,
                    cancel: self.cancel.clone(),
                });
                outcome_cap = self
                    .download_submitted(context, &classification, &writer, &mut stats)
                    .await;
            }
        }

        let manifest = writer.record.into_inner();
        if mode.downloads() || (self.options.update && manifest != snapshot) {
            self.store
                .save(name, &manifest, true)
                .with_context(|| format!("saving manifest for {name}"))?;
        }

        Ok(CollectionOutcome {
            stats,
            cap_reached: outcome_cap,
        })
    }

    async fn list_entries(&self, url: String, archive: Option<PathBuf>) -> Result<Listing> {
        let engine = Arc::clone(&self.engine);
        let cancel = self.cancel.clone();
        let listing_url = url.clone();
        let listed = tokio::task::spawn_blocking(move || -> Result<Listing, FetchError> {
            let mut listing = Listing {
                entries: Vec::new(),
                complete: true,
            };
            for item in engine.list_entries(&listing_url, archive.as_deref())? {
                if cancel.is_cancelled() {
                    listing.complete = false;
                    break;
                }
                match item {
                    Ok(entry) => listing.entries.push(entry),
                    Err(err) if listing.entries.is_empty() => return Err(err),
                    Err(err) => {
                        tracing::warn!("listing stopped early: {err}");
                        listing.complete = false;
                        break;
                    }
                }
            }
            Ok(listing)
        })
        .await
        .context("listing task failed")?;
        listed.with_context(|| format!("listing {url}"))
    }

    /// Feeds `submitted` entries to the worker pool. Returns whether the
    /// run-wide submission cap was hit.
    async fn download_submitted(
        &self,
        context: Arc<JobContext>,
        classification: &Classification,
        writer: &ManifestWriter,
        stats: &mut CollectionStats,
    ) -> bool {
        let semaphore = Arc::new(Semaphore::new(self.options.workers.max(1)));
        let mut tasks: JoinSet<JobReport> = JoinSet::new();
        let mut cap_reached = false;
        let mut local_submitted = 0usize;

        for entry in classification.with_status(Status::Submitted) {
            while let Some(done) = tasks.try_join_next() {
                absorb(done, writer, stats).await;
            }
            if self.cancel.is_cancelled() {
                break;
            }
            if self.submitted.load(Ordering::Relaxed) >= self.options.max_submitted {
                tracing::warn!("maximum of {} submitted videos reached", self.options.max_submitted);
                cap_reached = true;
                break;
            }
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            self.submitted.fetch_add(1, Ordering::Relaxed);
            local_submitted += 1;
            stats.record_queued();
            let job = EntryJob {
                index: entry.index,
                entry: entry.entry.clone(),
            };
            let context = Arc::clone(&context);
            tasks.spawn(async move {
                let _permit = permit;
                context.run(job).await
            });
        }

        if local_submitted > 0 {
            tracing::info!(collection = %context.collection.name, "submitted {local_submitted} videos for downloading");
        }
        while let Some(done) = tasks.join_next().await {
            absorb(done, writer, stats).await;
        }
        cap_reached
    }
}

/// Entries listed for a collection. `complete` is false when the listing was
/// cut short, in which case absent urls prove nothing.
struct Listing {
    entries: Vec<RemoteEntry>,
    complete: bool,
}

/// Digits needed for the largest playlist position.
fn index_width(entries: &[RemoteEntry]) -> usize {
    entries
        .iter()
        .filter_map(|entry| entry.playlist_count.max(entry.playlist_index))
        .max()
        .unwrap_or(0)
        .max(entries.len())
        .to_string()
        .len()
}

/// Single writer for a collection's manifest; every commit is saved at once.
/// Commits come from the task driving the pool, so saves never overlap.
struct ManifestWriter {
    store: ManifestStore,
    name: String,
    record: Mutex<ManifestRecord>,
}

impl ManifestWriter {
    async fn commit(&self, download: DownloadRecord) -> Result<()> {
        let snapshot = {
            let mut record = self.record.lock();
            record.record_download(download);
            record.clone()
        };
        let store = self.store.clone();
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || store.save(&name, &snapshot, true))
            .await
            .context("manifest save task failed")?
    }
}

async fn absorb(done: Result<JobReport, JoinError>, writer: &ManifestWriter, stats: &mut CollectionStats) {
    let report = match done {
        Ok(report) => report,
        Err(err) => {
            tracing::error!("download task aborted: {err}");
            stats.record_failure(FailedItem {
                url: String::new(),
                title: String::new(),
                location: String::new(),
                error: err.to_string(),
                index: 0,
            });
            return;
        }
    };
    match report {
        JobReport::Downloaded(record, status) => {
            stats.record_downloaded(DownloadResult {
                status,
                title: record.title.clone(),
                file: record.file.clone(),
                location: record.location.clone(),
                url: record.url.clone(),
            });
            if let Err(err) = writer.commit(record).await {
                tracing::error!("could not save manifest: {err:#}");
            }
        }
        JobReport::AlreadyPresent(record) => {
            stats.record_skipped();
            if let Err(err) = writer.commit(record).await {
                tracing::error!("could not save manifest: {err:#}");
            }
        }
        JobReport::Unavailable => stats.record_skipped(),
        JobReport::Failed(item) => stats.record_failure(item),
        JobReport::Cancelled => {}
    }
}

#[derive(Debug, Error)]
enum ItemError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ItemError {
    fn is_retryable(&self) -> bool {
        matches!(self, ItemError::Fetch(err) if err.is_retryable())
    }
}

#[derive(Debug, Clone)]
struct EntryJob {
    index: usize,
    entry: RemoteEntry,
}

#[derive(Debug)]
enum JobReport {
    Downloaded(DownloadRecord, ResultStatus),
    /// The target file was already there (possibly after a legacy rename).
    AlreadyPresent(DownloadRecord),
    Unavailable,
    Failed(FailedItem),
    Cancelled,
}

/// Everything a worker needs, shared by all jobs of one collection.
struct JobContext {
    engine: Arc<dyn FetchEngine>,
    muxer: Arc<dyn MediaMuxer>,
    observer: Arc<dyn ProgressObserver>,
    collection: CollectionConfig,
    output_dir: PathBuf,
    work_dir: PathBuf,
    location: String,
    index_width: usize,
    retries: u32,
    throttle: Duration,
    cancel: CancellationToken,
}

impl JobContext {
    async fn run(self: Arc<Self>, job: EntryJob) -> JobReport {
        if self.cancel.is_cancelled() {
            return JobReport::Cancelled;
        }
        let mut attempt = 0u32;
        loop {
            let context = Arc::clone(&self);
            let blocking_job = job.clone();
            let result = tokio::task::spawn_blocking(move || context.fetch_and_merge(&blocking_job))
                .await
                .unwrap_or_else(|err| Err(ItemError::Other(anyhow!("worker failed: {err}"))));

            match result {
                Ok(report) => {
                    self.pause().await;
                    return report;
                }
                Err(err) if err.is_retryable() && attempt < self.retries && !self.cancel.is_cancelled() => {
                    attempt += 1;
                    tracing::warn!(url = %job.entry.url, attempt, "retrying \"{}\": {err}", job.entry.title);
                    self.pause().await;
                }
                Err(ItemError::Fetch(err)) if err.is_benign() => {
                    tracing::debug!(url = %job.entry.url, "skipping \"{}\": {err}", job.entry.title);
                    self.pause().await;
                    return JobReport::Unavailable;
                }
                Err(err) => {
                    tracing::warn!(url = %job.entry.url, "error downloading \"{}\": {err}", job.entry.title);
                    self.pause().await;
                    return JobReport::Failed(FailedItem {
                        url: job.entry.url.clone(),
                        title: job.entry.title.clone(),
                        location: self.location.clone(),
                        error: err.to_string(),
                        index: job.index,
                    });
                }
            }
        }
    }

    async fn pause(&self) {
        if self.throttle.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.throttle) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    fn naming_prefix(&self, index: usize, channel: &str) -> String {
        let mut prefix = String::new();
        if self.collection.count {
            prefix.push_str(&format!("{index:0width$} - ", width = self.index_width));
        }
        if self.collection.add_channel {
            prefix.push_str(&format!("[{}] - ", sanitize(channel, Charset::Current)));
        }
        prefix
    }

    /// Blocking body of one download: details, streams, extras, merge.
    fn fetch_and_merge(&self, job: &EntryJob) -> Result<JobReport, ItemError> {
        let url = job.entry.url.as_str();
        let details = self.engine.video_details(url)?;
        let title = if details.title.is_empty() {
            job.entry.title.clone()
        } else {
            details.title.clone()
        };
        let channel = job.entry.channel.as_deref().unwrap_or(&details.author);
        let prefix = self.naming_prefix(job.index, channel);
        let extension = self.collection.media_extension();

        let stem = file_stem(&prefix, &title, Charset::Current, url);
        let legacy_stem = file_stem(&prefix, &title, Charset::Legacy, url);
        migrate_legacy_files(&self.output_dir, &legacy_stem, &stem, extension)
            .with_context(|| format!("renaming legacy files for {title}"))?;

        let file_name = format!("{stem}.{extension}");
        let target = self.output_dir.join(&file_name);
        let record = DownloadRecord {
            url: normalize_url(url),
            title: title.clone(),
            location: self.location.clone(),
            file: file_name,
        };
        if target.exists() {
            self.observer.on_status(&format!("Skipped - \"{title}\""));
            return Ok(JobReport::AlreadyPresent(record));
        }

        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("creating {}", self.output_dir.display()))?;
        fs::create_dir_all(&self.work_dir)
            .with_context(|| format!("creating {}", self.work_dir.display()))?;
        let scratch = tempfile::Builder::new()
            .prefix("item-")
            .tempdir_in(&self.work_dir)
            .context("creating item scratch directory")?;
        let tmp = |suffix: &str| scratch.path().join(format!("tmp_{}{suffix}", job.index));

        let inputs = if self.collection.audio_only {
            self.observer.on_status(&format!("Music - \"{title}\""));
            let audio = self
                .engine
                .download(url, StreamKind::Audio, &tmp("_audio"), self.observer.as_ref())?;
            MergeInputs {
                audio,
                ..MergeInputs::default()
            }
        } else {
            self.observer.on_status(&format!("Video - \"{title}\""));
            let video = self
                .engine
                .download(url, StreamKind::Video, &tmp("_video"), self.observer.as_ref())?;
            self.observer.on_status(&format!("Audio - \"{title}\""));
            let audio = self
                .engine
                .download(url, StreamKind::Audio, &tmp("_audio"), self.observer.as_ref())?;
            let duration_ms = details.duration_secs.map(|secs| (secs.max(0.0) * 1000.0) as u64);
            let chapters = mux::write_chapter_file(&tmp(".ffmeta"), &details.chapters, duration_ms)?;
            MergeInputs {
                video: Some(video),
                audio,
                chapters,
                subtitle: self.fetch_subtitle(url, &details, &tmp("")),
                thumbnail: self.fetch_thumbnail(&details, &tmp(".jpg")),
            }
        };

        self.observer.on_status(&format!("Merging - \"{title}\""));
        let meta = MediaMetadata {
            title: title.clone(),
            author: details.author.clone(),
            publish_date: details.publish_date.clone(),
            tags: details.tags.clone(),
            age_restricted: details.age_restricted,
            description: details.description.clone(),
            chapters: details.chapters.clone(),
        };
        mux::merge(self.muxer.as_ref(), &inputs, &meta, &target)?;
        self.observer.on_status(&format!("Success - \"{title}\""));
        let status = if self.collection.audio_only {
            ResultStatus::Music
        } else {
            ResultStatus::Downloaded
        };
        Ok(JobReport::Downloaded(record, status))
    }

    /// Tries each preferred caption in turn; any failure just means no
    /// subtitle track.
    fn fetch_subtitle(&self, url: &str, details: &VideoDetails, stem: &Path) -> Option<PathBuf> {
        for key in details.caption_candidates(&CAPTION_PREFERENCE) {
            match self.engine.fetch_caption(url, key, stem) {
                Ok(Some(path)) => return Some(path),
                Ok(None) => tracing::debug!(url, key, "caption track produced no file"),
                Err(err) => tracing::debug!(url, key, "caption download failed: {err}"),
            }
        }
        None
    }

    fn fetch_thumbnail(&self, details: &VideoDetails, dest: &Path) -> Option<PathBuf> {
        let thumbnail_url = details.thumbnail_url.as_deref()?;
        match self.engine.fetch_thumbnail(thumbnail_url, dest) {
            Ok(found) => found,
            Err(err) => {
                tracing::debug!(url = thumbnail_url, "thumbnail download failed: {err}");
                None
            }
        }
    }
}

/// `[prefix]<title>` with the given charset; untitled videos fall back to
/// their id.
fn file_stem(prefix: &str, title: &str, charset: Charset, url: &str) -> String {
    let name = title_safe(title, charset);
    if name.trim().is_empty() {
        format!("{prefix}{}", archive_id(url))
    } else {
        format!("{prefix}{name}")
    }
}

fn rename_if_present(from: &Path, to: &Path) -> io::Result<bool> {
    if to.exists() {
        return Ok(false);
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Renames a media file and its sidecar from the legacy naming scheme.
fn migrate_legacy_files(dir: &Path, legacy_stem: &str, stem: &str, extension: &str) -> io::Result<()> {
    if legacy_stem == stem {
        return Ok(());
    }
    for ext in [extension, "yml"] {
        let from = dir.join(format!("{legacy_stem}.{ext}"));
        let to = dir.join(format!("{stem}.{ext}"));
        if rename_if_present(&from, &to)? {
            tracing::info!("renamed {} to {}", from.display(), to.display());
        }
    }
    Ok(())
}

/// Restores sidecars of already archived files that still carry a legacy
/// name.
fn migrate_legacy_sidecars(dir: &Path, classification: &Classification) {
    for entry in classification.with_status(Status::Skipped) {
        let Some(file) = entry.existing_file.as_deref() else {
            continue;
        };
        let sidecar = sidecar_path(&dir.join(file));
        if sidecar.exists() {
            continue;
        }
        let Some(stem) = Path::new(file).file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        let legacy = sanitize(stem, Charset::Legacy);
        if legacy == stem {
            continue;
        }
        match rename_if_present(&dir.join(format!("{legacy}.yml")), &sidecar) {
            Ok(true) => tracing::info!("restored sidecar {}", sidecar.display()),
            Ok(false) => {}
            Err(err) => tracing::warn!("could not rename legacy sidecar for {file}: {err}"),
        }
    }
}

/// Media files directly inside `dir`, sorted. A missing directory is empty.
pub fn scan_media_files(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let is_media = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| MEDIA_EXTENSIONS.contains(&ext));
        if is_media && let Some(name) = path.file_name().and_then(|name| name.to_str()) {
            files.push(name.to_string());
        }
    }
    files.sort();
    Ok(files)
}
