#![forbid(unsafe_code)]

//! Command-line entry point: syncs every collection in the collections file
//! against the local archive and writes the run reports.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tubearchive_tools::config::{
    RuntimeOverrides, RuntimeSettings, load_collections, load_ignore_list, resolve_runtime_settings,
};
use tubearchive_tools::fetch::YtDlpEngine;
use tubearchive_tools::manifest::ManifestStore;
use tubearchive_tools::mux::FfmpegMuxer;
use tubearchive_tools::pipeline::{ArchiveOptions, Archiver, RunMode};
use tubearchive_tools::progress::{LogObserver, ProgressFile, ProgressObserver};
use tubearchive_tools::sanitize::default_unicode_normalization;
use tubearchive_tools::stats::ReportPaths;

const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "tubearchive", about = "Mirror YouTube playlists and channels into a local archive")]
struct Cli {
    /// Archive root; overrides ARCHIVE_ROOT
    #[arg(long)]
    path: Option<PathBuf>,

    /// Write to the NAS root (ARCHIVE_NAS_ROOT) instead of the archive root
    #[arg(long)]
    nas: bool,

    /// Collections file
    #[arg(long, visible_alias = "data", default_value = "data.yml")]
    collections: PathBuf,

    /// Urls to ignore in every collection
    #[arg(long, default_value = "ignore.yml")]
    ignore: PathBuf,

    /// Directory holding the per-collection manifests
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long, default_value = "stats.yml")]
    stats_file: PathBuf,

    #[arg(long, default_value = "special.yml")]
    special_file: PathBuf,

    #[arg(long, default_value = "failed.yml")]
    failed_file: PathBuf,

    #[arg(long, default_value = "missing.yml")]
    missing_file: PathBuf,

    /// Per-collection list of what this run downloaded
    #[arg(long, default_value = "results.yml")]
    results_file: PathBuf,

    /// Download new entries
    #[arg(long)]
    download: bool,

    /// Reconcile against the disk; implied when --download is absent
    #[arg(long)]
    stats: bool,

    /// Record files found on disk in the manifest
    #[arg(long)]
    update: bool,

    /// Treat recorded files absent from disk as deleted on purpose; implied by --nas
    #[arg(long)]
    trust_missing: bool,

    /// Only log warnings and errors
    #[arg(long, conflicts_with = "verbose")]
    quiet: bool,

    /// Skip writing report files
    #[arg(long)]
    no_report: bool,

    /// Debug logging and per-entry listings in the summary
    #[arg(long)]
    verbose: bool,

    /// Do not pause between downloads
    #[arg(long)]
    no_wait: bool,

    #[arg(long)]
    workers: Option<usize>,

    /// Cap on downloads submitted during this run
    #[arg(long)]
    max_submitted: Option<usize>,

    #[arg(long)]
    retries: Option<u32>,

    /// Settings file read before the defaults
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Mirror progress into this JSON file
    #[arg(long)]
    progress_file: Option<PathBuf>,

    #[arg(long, default_value = "yt-dlp")]
    yt_dlp: PathBuf,

    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: PathBuf,
}

impl Cli {
    fn mode(&self) -> RunMode {
        RunMode::from_flags(self.download, self.stats)
    }

    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            archive_root: self.path.clone(),
            data_dir: self.data_dir.clone(),
            workers: self.workers,
            max_submitted: self.max_submitted,
            retries: self.retries,
            throttle_secs: self.no_wait.then_some(0),
            env_path: self.env_file.clone(),
            trust_missing: self.trust_missing.then_some(true),
            ..RuntimeOverrides::default()
        }
    }

    fn report_paths(&self) -> ReportPaths {
        if self.no_report {
            return ReportPaths::default();
        }
        let reconciles = self.mode().reconciles();
        ReportPaths {
            stats: Some(self.stats_file.clone()),
            special: reconciles.then(|| self.special_file.clone()),
            failed: Some(self.failed_file.clone()),
            missing: reconciles.then(|| self.missing_file.clone()),
            results: Some(self.results_file.clone()),
        }
    }

    fn default_log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }

    /// The NAS copy is pruned by hand, so its missing files are trusted.
    fn trust_missing(&self, settings: &RuntimeSettings) -> bool {
        self.nas || settings.trust_missing
    }
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.default_log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Cancels `token` on the first Ctrl-C.
fn watch_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                tracing::warn!("interrupt received; letting running downloads finish");
                token.cancel();
            }
            Err(err) => tracing::warn!("could not listen for ctrl-c: {err}"),
        }
    });
}

/// Returns whether the run was interrupted.
async fn run(cli: Cli) -> Result<bool> {
    let settings = resolve_runtime_settings(cli.overrides())?;
    let media_root = settings.media_root(cli.nas)?.to_path_buf();
    let collections = load_collections(&cli.collections)
        .with_context(|| format!("loading collections from {}", cli.collections.display()))?;
    let ignore = load_ignore_list(&cli.ignore)
        .with_context(|| format!("loading ignore list from {}", cli.ignore.display()))?;

    let mode = cli.mode();
    tracing::info!(
        root = %media_root.display(),
        data = %settings.data_dir.display(),
        collections = collections.len(),
        ?mode,
        "starting run"
    );

    let work_dir = tempfile::Builder::new()
        .prefix("tubearchive-")
        .tempdir()
        .context("creating work directory")?;
    let options = ArchiveOptions {
        media_root,
        work_dir: work_dir.path().to_path_buf(),
        mode,
        update: cli.update,
        trust_missing: cli.trust_missing(&settings),
        normalize_unicode: default_unicode_normalization(),
        workers: settings.workers,
        max_submitted: settings.max_submitted,
        retries: settings.retries,
        throttle: if cli.no_wait { Duration::ZERO } else { settings.throttle },
    };
    let observer: Arc<dyn ProgressObserver> = match &cli.progress_file {
        Some(path) => Arc::new(ProgressFile::new(path)),
        None => Arc::new(LogObserver::new()),
    };

    let cancel = CancellationToken::new();
    watch_interrupt(cancel.clone());
    let archiver = Archiver::new(
        Arc::new(YtDlpEngine::new(&cli.yt_dlp)),
        Arc::new(FfmpegMuxer::new(&cli.ffmpeg)),
        ManifestStore::new(&settings.data_dir),
        options,
    )
    .with_observer(observer)
    .with_cancellation(cancel);

    let summary = archiver.run(&collections, &ignore).await;
    if summary.cap_reached {
        tracing::warn!("stopped submitting after {} downloads", summary.submitted);
    }
    summary.stats.log_summary(cli.verbose);
    let reported = summary.stats.write_reports(&cli.report_paths());
    work_dir.close().context("removing work directory")?;
    reported?;
    Ok(summary.interrupted)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);
    match run(cli).await {
        Ok(false) => ExitCode::SUCCESS,
        Ok(true) => {
            tracing::warn!("run interrupted");
            ExitCode::from(EXIT_INTERRUPTED)
        }
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("tubearchive").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_to_stats_only_with_all_reports() {
        let cli = parse(&[]);
        assert_eq!(cli.mode(), RunMode::StatsOnly);
        assert_eq!(cli.collections, PathBuf::from("data.yml"));
        let paths = cli.report_paths();
        assert_eq!(paths.stats, Some(PathBuf::from("stats.yml")));
        assert_eq!(paths.missing, Some(PathBuf::from("missing.yml")));
        assert_eq!(paths.results, Some(PathBuf::from("results.yml")));
        assert_eq!(cli.default_log_level(), "info");
    }

    #[test]
    fn download_flags_select_mode_and_reports() {
        let cli = parse(&["--download"]);
        assert_eq!(cli.mode(), RunMode::DownloadOnly);
        assert!(cli.report_paths().special.is_none());
        assert!(cli.report_paths().failed.is_some());
        assert_eq!(cli.report_paths().results, Some(PathBuf::from("results.yml")));

        let cli = parse(&["--download", "--results-file", "out/done.yml"]);
        assert_eq!(cli.report_paths().results, Some(PathBuf::from("out/done.yml")));

        let cli = parse(&["--download", "--stats", "--no-report"]);
        assert_eq!(cli.mode(), RunMode::Both);
        let paths = cli.report_paths();
        assert!(paths.stats.is_none() && paths.failed.is_none() && paths.results.is_none());
    }

    #[test]
    fn overrides_carry_cli_values() {
        let cli = parse(&[
            "--path",
            "/srv/yt",
            "--data",
            "lists.yml",
            "--workers",
            "4",
            "--max-submitted",
            "10",
            "--no-wait",
        ]);
        assert_eq!(cli.collections, PathBuf::from("lists.yml"));
        let overrides = cli.overrides();
        assert_eq!(overrides.archive_root, Some(PathBuf::from("/srv/yt")));
        assert_eq!(overrides.workers, Some(4));
        assert_eq!(overrides.max_submitted, Some(10));
        assert_eq!(overrides.throttle_secs, Some(0));
        assert!(overrides.nas_root.is_none());
    }

    #[test]
    fn trust_missing_comes_from_flag_nas_or_settings() {
        let mut settings = RuntimeSettings::default();
        assert!(!parse(&[]).trust_missing(&settings));
        assert!(parse(&["--nas"]).trust_missing(&settings));
        assert_eq!(parse(&["--trust-missing"]).overrides().trust_missing, Some(true));
        assert!(parse(&[]).overrides().trust_missing.is_none());

        settings.trust_missing = true;
        assert!(parse(&[]).trust_missing(&settings));
    }

    #[test]
    fn quiet_and_verbose_conflict() {
        assert!(Cli::try_parse_from(["tubearchive", "--quiet", "--verbose"]).is_err());
        assert_eq!(parse(&["--quiet"]).default_log_level(), "warn");
        assert_eq!(parse(&["--verbose"]).default_log_level(), "debug");
    }
}
