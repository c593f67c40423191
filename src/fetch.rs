#![forbid(unsafe_code)]

//! The fetch engine: listing a playlist, describing a video and pulling its
//! streams, captions and thumbnail.
//!
//! [`FetchEngine`] is the seam the pipeline depends on. [`YtDlpEngine`] backs
//! it with the `yt-dlp` executable (plus a plain HTTP GET for thumbnails).

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::progress::ProgressObserver;

/// One video as the remote listing reports it right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub url: String,
    pub title: String,
    pub channel: Option<String>,
    /// `None` for private, deleted or otherwise unavailable placeholders.
    pub view_count: Option<u64>,
    /// 1-based position in the full playlist, also when the listing was
    /// filtered by an archive.
    pub playlist_index: Option<usize>,
    /// Length of the full playlist.
    pub playlist_count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    /// Start offset in milliseconds.
    pub start: u64,
    pub title: String,
}

/// Everything the merge step needs to know about one video.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoDetails {
    pub title: String,
    pub author: String,
    pub description: String,
    pub tags: Vec<String>,
    /// ISO date (`YYYY-MM-DD`).
    pub publish_date: Option<String>,
    pub age_restricted: bool,
    pub duration_secs: Option<f64>,
    pub chapters: Vec<Chapter>,
    /// Caption tracks; automatic ones carry an `a.` prefix (`a.en`).
    pub captions: Vec<String>,
    pub thumbnail_url: Option<String>,
}

impl VideoDetails {
    pub fn has_caption(&self, key: &str) -> bool {
        self.captions.iter().any(|caption| caption == key)
    }

    /// Caption keys from `preferred` that the video offers, in order.
    pub fn caption_candidates<'a>(
        &'a self,
        preferred: &'a [&'a str],
    ) -> impl Iterator<Item = &'a str> + 'a {
        preferred.iter().copied().filter(|key| self.has_caption(key))
    }

    /// First caption key from `preferred` that the video offers.
    pub fn pick_caption<'a>(&'a self, preferred: &'a [&'a str]) -> Option<&'a str> {
        self.caption_candidates(preferred).next()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    fn format_selector(self) -> &'static str {
        match self {
            StreamKind::Video => "bestvideo[ext=mp4]/bestvideo",
            StreamKind::Audio => "bestaudio[ext=m4a]/bestaudio",
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("login required: {0}")]
    LoginRequired(String),
    #[error("bot detection triggered: {0}")]
    BotDetection(String),
    #[error("age restricted: {0}")]
    AgeRestricted(String),
    #[error("video unavailable: {0}")]
    Unavailable(String),
    #[error("source not found: {0}")]
    NotFound(String),
    #[error("could not run {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("unexpected engine output: {0}")]
    Malformed(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl FetchError {
    /// Maps yt-dlp's stderr onto an error class.
    pub fn from_stderr(stderr: &str) -> Self {
        let message = last_error_line(stderr);
        let lower = stderr.to_lowercase();

        if lower.contains("confirm your age") || lower.contains("age-restricted") {
            return FetchError::AgeRestricted(message);
        }
        if lower.contains("not a bot") || lower.contains("bot detection") {
            return FetchError::BotDetection(message);
        }
        if lower.contains("please sign in")
            || lower.contains("login required")
            || lower.contains("use --cookies")
            || lower.contains("cookies are no longer valid")
        {
            return FetchError::LoginRequired(message);
        }
        if lower.contains("private video")
            || lower.contains("video unavailable")
            || lower.contains("video is not available")
            || lower.contains("has been removed")
        {
            return FetchError::Unavailable(message);
        }
        if lower.contains("http error 404") || lower.contains("does not exist") {
            return FetchError::NotFound(message);
        }
        FetchError::Transient(message)
    }

    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Transient(_) | FetchError::Io { .. } | FetchError::Malformed(_)
        )
    }

    /// Remote-side conditions that are expected and not worth an error log.
    pub fn is_benign(&self) -> bool {
        matches!(self, FetchError::Unavailable(_))
    }

    fn io(context: impl Into<String>, source: io::Error) -> Self {
        FetchError::Io {
            context: context.into(),
            source,
        }
    }
}

fn last_error_line(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with("ERROR:"))
        .or_else(|| stderr.lines().map(str::trim).rfind(|line| !line.is_empty()))
        .unwrap_or("no error output")
        .to_string()
}

pub type EntryStream<'a> = Box<dyn Iterator<Item = Result<RemoteEntry, FetchError>> + Send + 'a>;

/// External download engine. Calls block; the pipeline runs them on the
/// blocking thread pool.
pub trait FetchEngine: Send + Sync {
    /// Lazily lists a playlist or channel. With an archive, entries recorded
    /// in it are left out.
    fn list_entries(&self, url: &str, archive: Option<&Path>) -> Result<EntryStream<'_>, FetchError>;

    fn video_details(&self, url: &str) -> Result<VideoDetails, FetchError>;

    /// Downloads one stream to `<stem>.<ext>` and returns the written path.
    fn download(
        &self,
        url: &str,
        kind: StreamKind,
        stem: &Path,
        observer: &dyn ProgressObserver,
    ) -> Result<PathBuf, FetchError>;

    /// Writes the caption track `key` as SRT; `Ok(None)` if none was produced.
    fn fetch_caption(&self, url: &str, key: &str, stem: &Path) -> Result<Option<PathBuf>, FetchError>;

    /// Stores the image at `dest`; `Ok(None)` when the server has none.
    fn fetch_thumbnail(&self, thumbnail_url: &str, dest: &Path) -> Result<Option<PathBuf>, FetchError>;
}

/// Raw entry emitted by `yt-dlp --flat-playlist --dump-json`.
#[derive(Debug, Deserialize)]
struct FlatEntry {
    id: Option<String>,
    url: Option<String>,
    title: Option<String>,
    channel: Option<String>,
    uploader: Option<String>,
    view_count: Option<u64>,
    playlist_index: Option<usize>,
    playlist_count: Option<usize>,
}

impl FlatEntry {
    fn into_remote(self) -> Option<RemoteEntry> {
        let url = match (self.url, self.id) {
            (Some(url), _) if url.starts_with("http") => url,
            (_, Some(id)) => video_url(&id),
            (Some(url), None) => video_url(&url),
            (None, None) => return None,
        };
        Some(RemoteEntry {
            url,
            title: self.title.unwrap_or_default(),
            channel: self.channel.or(self.uploader),
            view_count: self.view_count,
            playlist_index: self.playlist_index,
            playlist_count: self.playlist_count,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawChapter {
    start_time: Option<f64>,
    title: Option<String>,
}

/// Subset of `yt-dlp --dump-single-json`.
#[derive(Debug, Deserialize)]
struct InfoJson {
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    description: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    upload_date: Option<String>,
    age_limit: Option<u32>,
    duration: Option<f64>,
    #[serde(default)]
    chapters: Option<Vec<RawChapter>>,
    #[serde(default)]
    subtitles: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    automatic_captions: Option<serde_json::Map<String, Value>>,
    thumbnail: Option<String>,
}

impl InfoJson {
    fn into_details(self) -> VideoDetails {
        let mut captions: Vec<String> = self
            .subtitles
            .iter()
            .flat_map(|map| map.keys().cloned())
            .collect();
        captions.extend(
            self.automatic_captions
                .iter()
                .flat_map(|map| map.keys().map(|key| format!("a.{key}"))),
        );
        let chapters = self
            .chapters
            .unwrap_or_default()
            .into_iter()
            .map(|chapter| Chapter {
                start: (chapter.start_time.unwrap_or(0.0).max(0.0) * 1000.0).round() as u64,
                title: chapter.title.unwrap_or_default(),
            })
            .collect();
        VideoDetails {
            title: self.title.unwrap_or_default(),
            author: self
                .channel
                .or(self.uploader)
                .unwrap_or_else(|| "Unknown".to_string()),
            description: self.description.unwrap_or_else(|| "Unknown".to_string()),
            tags: self.tags,
            publish_date: self.upload_date.as_deref().and_then(upload_date_to_iso),
            age_restricted: self.age_limit.is_some_and(|limit| limit >= 18),
            duration_secs: self.duration,
            chapters,
            captions,
            thumbnail_url: self.thumbnail,
        }
    }
}

/// `yt-dlp` reports `YYYYMMDD`.
pub fn upload_date_to_iso(value: &str) -> Option<String> {
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .ok()
        .map(|date| date.format("%Y-%m-%d").to_string())
}

pub fn video_url(id: &str) -> String {
    format!("https://youtube.com/watch?v={id}")
}

const PROGRESS_PREFIX: &str = "progress:";
const DEFAULT_THUMBNAIL_TIMEOUT: Duration = Duration::from_secs(30);

/// [`FetchEngine`] backed by the `yt-dlp` command line tool.
pub struct YtDlpEngine {
    program: PathBuf,
    extra_args: Vec<OsString>,
    http: ureq::Agent,
}

impl Default for YtDlpEngine {
    fn default() -> Self {
        Self::new("yt-dlp")
    }
}

impl YtDlpEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let http = ureq::AgentBuilder::new()
            .timeout(DEFAULT_THUMBNAIL_TIMEOUT)
            .build();
        Self {
            program: program.into(),
            extra_args: Vec::new(),
            http,
        }
    }

    /// Arguments passed to every invocation, e.g. `--cookies <file>`.
    pub fn with_extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.extra_args).arg("--no-warnings");
        command
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    fn run(&self, mut command: Command) -> Result<String, FetchError> {
        let output = command.output().map_err(|source| FetchError::Launch {
            program: self.program_name(),
            source,
        })?;
        if !output.status.success() {
            return Err(FetchError::from_stderr(&String::from_utf8_lossy(&output.stderr)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl FetchEngine for YtDlpEngine {
    fn list_entries(&self, url: &str, archive: Option<&Path>) -> Result<EntryStream<'_>, FetchError> {
        let mut command = self.command();
        command
            .arg("--flat-playlist")
            .arg("--dump-json")
            .arg("--ignore-errors");
        if let Some(archive) = archive {
            command.arg("--download-archive").arg(archive);
        }
        command
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| FetchError::Launch {
            program: self.program_name(),
            source,
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FetchError::Malformed("listing has no stdout".into()))?;
        let stderr = child.stderr.take().map(drain_in_background);
        Ok(Box::new(FlatListing {
            child,
            lines: BufReader::new(stdout),
            stderr,
            yielded: 0,
            finished: false,
        }))
    }

    fn video_details(&self, url: &str) -> Result<VideoDetails, FetchError> {
        let mut command = self.command();
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-playlist")
            .arg(url);
        let stdout = self.run(command)?;
        let info: InfoJson = serde_json::from_str(stdout.trim())
            .map_err(|err| FetchError::Malformed(format!("video info for {url}: {err}")))?;
        Ok(info.into_details())
    }

    fn download(
        &self,
        url: &str,
        kind: StreamKind,
        stem: &Path,
        observer: &dyn ProgressObserver,
    ) -> Result<PathBuf, FetchError> {
        let mut template = stem.as_os_str().to_owned();
        template.push(".%(ext)s");

        let mut command = self.command();
        command
            .arg("--no-playlist")
            .arg("--format")
            .arg(kind.format_selector())
            .arg("--output")
            .arg(&template)
            .arg("--newline")
            .arg("--progress")
            .arg("--progress-template")
            .arg(format!(
                "download:{PROGRESS_PREFIX}%(progress.downloaded_bytes)s/%(progress.total_bytes)s"
            ))
            .arg("--no-simulate")
            .arg("--print")
            .arg("after_move:filepath")
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| FetchError::Launch {
            program: self.program_name(),
            source,
        })?;
        let stderr = child.stderr.take().map(drain_in_background);
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FetchError::Malformed("download has no stdout".into()))?;

        let mut written = None;
        for line in BufReader::new(stdout).lines() {
            let line = line.map_err(|err| FetchError::io("reading download output", err))?;
            let line = line.trim();
            if let Some(progress) = line.strip_prefix(PROGRESS_PREFIX) {
                if let Some(fraction) = parse_progress(progress) {
                    observer.on_progress(fraction);
                }
            } else if !line.is_empty() {
                written = Some(PathBuf::from(line));
            }
        }

        let status = child
            .wait()
            .map_err(|err| FetchError::io("waiting for download", err))?;
        let stderr = join_stderr(stderr);
        if !status.success() {
            return Err(FetchError::from_stderr(&stderr));
        }
        observer.on_progress(1.0);
        match written {
            Some(path) if path.exists() => Ok(path),
            Some(path) => Err(FetchError::Malformed(format!(
                "reported file {} does not exist",
                path.display()
            ))),
            None => Err(FetchError::Malformed(format!("no file reported for {url}"))),
        }
    }

    fn fetch_caption(&self, url: &str, key: &str, stem: &Path) -> Result<Option<PathBuf>, FetchError> {
        let (automatic, language) = match key.strip_prefix("a.") {
            Some(language) => (true, language),
            None => (false, key),
        };
        let mut command = self.command();
        command
            .arg("--skip-download")
            .arg("--no-playlist")
            .arg(if automatic {
                "--write-auto-subs"
            } else {
                "--write-subs"
            })
            .arg("--sub-langs")
            .arg(language)
            .arg("--convert-subs")
            .arg("srt")
            .arg("--output")
            .arg(stem)
            .arg(url);
        self.run(command)?;

        let mut expected = stem.as_os_str().to_owned();
        expected.push(format!(".{language}.srt"));
        let expected = PathBuf::from(expected);
        Ok(expected.exists().then_some(expected))
    }

    fn fetch_thumbnail(&self, thumbnail_url: &str, dest: &Path) -> Result<Option<PathBuf>, FetchError> {
        let response = match self.http.get(thumbnail_url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                tracing::debug!(url = thumbnail_url, code, "thumbnail not available");
                return Ok(None);
            }
            Err(err) => return Err(FetchError::Transient(format!("thumbnail {thumbnail_url}: {err}"))),
        };
        let mut file = File::create(dest)
            .map_err(|err| FetchError::io(format!("creating {}", dest.display()), err))?;
        io::copy(&mut response.into_reader(), &mut file)
            .map_err(|err| FetchError::io(format!("writing {}", dest.display()), err))?;
        Ok(Some(dest.to_path_buf()))
    }
}

/// Parses `<downloaded>/<total>` as emitted by the progress template.
fn parse_progress(value: &str) -> Option<f64> {
    let (done, total) = value.split_once('/')?;
    let done: f64 = done.trim().parse().ok()?;
    let total: f64 = total.trim().parse().ok()?;
    (total > 0.0).then(|| (done / total).clamp(0.0, 1.0))
}

fn drain_in_background<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = String::new();
        let _ = reader.read_to_string(&mut buffer);
        buffer
    })
}

fn join_stderr(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Streaming reader over a running `--flat-playlist` process.
struct FlatListing {
    child: Child,
    lines: BufReader<ChildStdout>,
    stderr: Option<JoinHandle<String>>,
    yielded: usize,
    finished: bool,
}

impl FlatListing {
    fn finish(&mut self) -> Option<Result<RemoteEntry, FetchError>> {
        self.finished = true;
        let status: io::Result<ExitStatus> = self.child.wait();
        let stderr = join_stderr(self.stderr.take());
        match status {
            Err(err) => Some(Err(FetchError::io("waiting for listing", err))),
            // A non-zero exit means the listing may be cut short, even when
            // some entries came through. Unavailable placeholders are the
            // exception: they are reported but do not stop the listing.
            Ok(status) if !status.success() => {
                let err = FetchError::from_stderr(&stderr);
                if self.yielded > 0 && err.is_benign() {
                    tracing::debug!("listing finished with skipped entries: {err}");
                    None
                } else {
                    Some(Err(err))
                }
            }
            Ok(_) => {
                if !stderr.trim().is_empty() {
                    tracing::debug!("listing stderr: {}", stderr.trim());
                }
                None
            }
        }
    }
}

impl Iterator for FlatListing {
    type Item = Result<RemoteEntry, FetchError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            let mut line = String::new();
            match self.lines.read_line(&mut line) {
                Ok(0) => return self.finish(),
                Ok(_) => {}
                Err(err) => {
                    self.finished = true;
                    let _ = self.child.kill();
                    return Some(Err(FetchError::io("reading listing", err)));
                }
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<FlatEntry>(line) {
                Ok(entry) => {
                    if let Some(entry) = entry.into_remote() {
                        self.yielded += 1;
                        return Some(Ok(entry));
                    }
                }
                Err(err) => tracing::debug!("skipping unparsable listing line: {err}"),
            }
        }
    }
}

impl Drop for FlatListing {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopObserver;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;

    fn install_ytdlp_stub(dir: &Path) -> PathBuf {
        let script_path = dir.join("yt-dlp");
        let script = r#"#!/usr/bin/env bash
set -eu
args=("$@")
output=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    --output)
      shift
      output="$1"
      ;;
  esac
  shift
done

if printf '%s\n' "${args[@]}" | grep -q -- '--flat-playlist'; then
  last="${args[${#args[@]}-1]}"
  if [[ "$last" == *missing* ]]; then
    echo "ERROR: [youtube:tab] missing: This playlist does not exist" >&2
    exit 1
  fi
  if [[ "$last" == *partial* ]]; then
    echo '{"id": "alpha", "title": "Alpha Title", "view_count": 10}'
    echo "ERROR: [youtube:tab] Read timed out" >&2
    exit 1
  fi
  echo '{"id": "alpha", "title": "Alpha Title", "channel": "Chan", "view_count": 10, "playlist_index": 3, "playlist_count": 12}'
  echo 'not json'
  echo '{"url": "https://www.youtube.com/watch?v=beta", "title": "[Private video]", "view_count": null}'
  exit 0
fi

if printf '%s\n' "${args[@]}" | grep -q -- '--dump-single-json'; then
  cat <<'JSON'
{"title": "Alpha Title", "channel": "Chan", "description": "About alpha", "tags": ["one", "two"],
 "upload_date": "20240131", "age_limit": 0, "duration": 90.0,
 "chapters": [{"start_time": 0.0, "title": "Intro"}, {"start_time": 12.5, "title": "Main"}],
 "subtitles": {"de": []}, "automatic_captions": {"en": []},
 "thumbnail": "http://127.0.0.1:9/alpha.jpg"}
JSON
  exit 0
fi

if printf '%s\n' "${args[@]}" | grep -q -- '--write-auto-subs'; then
  echo "1" > "${output}.en.srt"
  exit 0
fi

if printf '%s\n' "${args[@]}" | grep -q -- '--write-subs'; then
  exit 0
fi

if printf '%s\n' "${args[@]}" | grep -q -- 'bestaudio'; then
  echo "Sign in to confirm you're not a bot" >&2
  exit 1
fi

if printf '%s\n' "${args[@]}" | grep -q -- '--format'; then
  target="${output//%(ext)s/mp4}"
  echo "video" > "$target"
  echo "progress:50/100"
  echo "progress:NA/NA"
  echo "progress:100/100"
  echo "$target"
  exit 0
fi

exit 0
"#;
        fs::write(&script_path, script).unwrap();
        #[cfg(unix)]
        {
            let mut perms = fs::metadata(&script_path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&script_path, perms).unwrap();
        }
        script_path
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<f64>>);

    impl ProgressObserver for Recorder {
        fn on_progress(&self, fraction: f64) {
            self.0.lock().unwrap().push(fraction);
        }
        fn on_status(&self, _label: &str) {}
    }

    #[test]
    fn classifies_stderr_messages() {
        assert!(matches!(
            FetchError::from_stderr("ERROR: Sign in to confirm you're not a bot"),
            FetchError::BotDetection(_)
        ));
        assert!(matches!(
            FetchError::from_stderr("ERROR: Sign in to confirm your age"),
            FetchError::AgeRestricted(_)
        ));
        assert!(matches!(
            FetchError::from_stderr("ERROR: [youtube] x: Private video"),
            FetchError::Unavailable(_)
        ));
        let timeout = FetchError::from_stderr("WARNING: retrying\nERROR: Read timed out");
        assert!(timeout.is_retryable());
        assert_eq!(timeout.to_string(), "transient failure: ERROR: Read timed out");
        assert!(!FetchError::LoginRequired(String::new()).is_retryable());
    }

    #[test]
    fn caption_lookup_prefers_manual_english() {
        let mut details = VideoDetails {
            captions: vec!["a.en".into(), "de".into()],
            ..VideoDetails::default()
        };
        assert_eq!(details.pick_caption(&["en", "a.en"]), Some("a.en"));
        details.captions.push("en".into());
        assert_eq!(details.pick_caption(&["en", "a.en"]), Some("en"));
        details.captions.clear();
        assert_eq!(details.pick_caption(&["en", "a.en"]), None);
    }

    #[test]
    fn progress_parsing_handles_unknown_totals() {
        assert_eq!(parse_progress("25/100"), Some(0.25));
        assert_eq!(parse_progress("NA/NA"), None);
        assert_eq!(parse_progress("5/0"), None);
        assert_eq!(upload_date_to_iso("20240131").as_deref(), Some("2024-01-31"));
        assert_eq!(upload_date_to_iso("junk"), None);
    }

    #[cfg(unix)]
    #[test]
    fn lists_entries_lazily_and_skips_garbage() {
        let dir = tempdir().unwrap();
        let engine = YtDlpEngine::new(install_ytdlp_stub(dir.path()));
        let entries: Vec<RemoteEntry> = engine
            .list_entries("https://youtube.com/playlist?list=PL", None)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].url, "https://youtube.com/watch?v=alpha");
        assert_eq!(entries[0].channel.as_deref(), Some("Chan"));
        assert_eq!(entries[0].playlist_index, Some(3));
        assert_eq!(entries[0].playlist_count, Some(12));
        assert_eq!(entries[1].view_count, None);
        assert_eq!(entries[1].playlist_index, None);
    }

    #[cfg(unix)]
    #[test]
    fn listing_cut_short_ends_with_an_error() {
        let dir = tempdir().unwrap();
        let engine = YtDlpEngine::new(install_ytdlp_stub(dir.path()));
        let items: Vec<Result<RemoteEntry, FetchError>> = engine
            .list_entries("https://youtube.com/playlist?list=partial", None)
            .unwrap()
            .collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().title, "Alpha Title");
        assert!(matches!(items[1], Err(FetchError::Transient(_))));
    }

    #[cfg(unix)]
    #[test]
    fn empty_failed_listing_reports_not_found() {
        let dir = tempdir().unwrap();
        let engine = YtDlpEngine::new(install_ytdlp_stub(dir.path()));
        let mut stream = engine
            .list_entries("https://youtube.com/playlist?list=missing", None)
            .unwrap();
        assert!(matches!(stream.next(), Some(Err(FetchError::NotFound(_)))));
        assert!(stream.next().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn video_details_maps_info_json() {
        let dir = tempdir().unwrap();
        let engine = YtDlpEngine::new(install_ytdlp_stub(dir.path()));
        let details = engine.video_details("https://youtube.com/watch?v=alpha").unwrap();
        assert_eq!(details.title, "Alpha Title");
        assert_eq!(details.author, "Chan");
        assert_eq!(details.publish_date.as_deref(), Some("2024-01-31"));
        assert!(!details.age_restricted);
        assert_eq!(details.chapters[1].start, 12_500);
        assert_eq!(details.captions, vec!["de".to_string(), "a.en".to_string()]);
        assert_eq!(details.pick_caption(&["en", "a.en"]), Some("a.en"));
    }

    #[cfg(unix)]
    #[test]
    fn download_reports_progress_and_written_file() {
        let dir = tempdir().unwrap();
        let engine = YtDlpEngine::new(install_ytdlp_stub(dir.path()));
        let recorder = Recorder::default();
        let stem = dir.path().join("tmp_1");
        let path = engine
            .download("https://youtube.com/watch?v=alpha", StreamKind::Video, &stem, &recorder)
            .unwrap();
        assert_eq!(path, dir.path().join("tmp_1.mp4"));
        assert!(path.exists());
        assert_eq!(*recorder.0.lock().unwrap(), vec![0.5, 1.0, 1.0]);

        let err = engine
            .download("https://youtube.com/watch?v=alpha", StreamKind::Audio, &stem, &NoopObserver)
            .unwrap_err();
        assert!(matches!(err, FetchError::BotDetection(_)));
    }

    #[cfg(unix)]
    #[test]
    fn automatic_caption_is_written_as_srt() {
        let dir = tempdir().unwrap();
        let engine = YtDlpEngine::new(install_ytdlp_stub(dir.path()));
        let stem = dir.path().join("tmp_1");
        let written = engine
            .fetch_caption("https://youtube.com/watch?v=alpha", "a.en", &stem)
            .unwrap();
        assert_eq!(written, Some(dir.path().join("tmp_1.en.srt")));
        let manual = engine
            .fetch_caption("https://youtube.com/watch?v=alpha", "en", &dir.path().join("tmp_2"))
            .unwrap();
        assert_eq!(manual, None);
    }

    #[test]
    fn missing_program_is_a_launch_error() {
        let dir = tempdir().unwrap();
        let engine = YtDlpEngine::new(dir.path().join("no-such-yt-dlp"));
        let err = engine.video_details("https://youtube.com/watch?v=x").unwrap_err();
        assert!(matches!(err, FetchError::Launch { .. }));
    }
}
