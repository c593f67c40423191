#![forbid(unsafe_code)]

//! Combines downloaded streams, chapters, captions and a cover image into
//! the final container, then removes the intermediates and writes the
//! `.yml` sidecar next to the result.

use std::ffi::OsString;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fetch::Chapter;
use crate::persist::{read_yaml, remove_if_exists, write_atomic, write_yaml};

/// Title given to the embedded subtitle track.
pub const SUBTITLE_TRACK_TITLE: &str = "English Subs";

/// Caption keys tried in order: manual English, then automatic English.
pub const CAPTION_PREFERENCE: [&str; 2] = ["en", "a.en"];

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("subtitle track without a cover image is not muxed")]
    SubtitleWithoutThumbnail,
    #[error("could not run {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("removing intermediate {}: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("writing sidecar {}: {message}", path.display())]
    Sidecar { path: PathBuf, message: String },
}

/// Which optional video tracks go into the container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MuxVariant {
    Plain,
    Thumbnail,
    SubtitleOnly,
    Full,
}

impl MuxVariant {
    pub fn select(has_subtitle: bool, has_thumbnail: bool) -> Self {
        match (has_subtitle, has_thumbnail) {
            (false, false) => MuxVariant::Plain,
            (false, true) => MuxVariant::Thumbnail,
            (true, false) => MuxVariant::SubtitleOnly,
            (true, true) => MuxVariant::Full,
        }
    }
}

/// Descriptive fields embedded as global tags and kept in the sidecar.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaMetadata {
    pub title: String,
    pub author: String,
    pub publish_date: Option<String>,
    pub tags: Vec<String>,
    pub age_restricted: bool,
    pub description: String,
    pub chapters: Vec<Chapter>,
}

/// Input files for one merge. `video == None` means audio-only.
#[derive(Debug, Clone, Default)]
pub struct MergeInputs {
    pub video: Option<PathBuf>,
    pub audio: PathBuf,
    /// FFMETADATA file carrying chapter marks.
    pub chapters: Option<PathBuf>,
    pub subtitle: Option<PathBuf>,
    pub thumbnail: Option<PathBuf>,
}

impl MergeInputs {
    fn intermediates(&self) -> impl Iterator<Item = &Path> {
        [
            self.subtitle.as_deref(),
            self.chapters.as_deref(),
            self.thumbnail.as_deref(),
            self.video.as_deref(),
            Some(self.audio.as_path()),
        ]
        .into_iter()
        .flatten()
    }
}

/// Sidecar written once per final artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sidecar {
    pub title: String,
    pub author: String,
    pub description: String,
    pub tags: Vec<String>,
    pub age_restricted: bool,
    pub publish_date: Option<String>,
    pub subtitles: bool,
    pub thumbnail: bool,
    pub chapters: Vec<Chapter>,
}

pub fn sidecar_path(media: &Path) -> PathBuf {
    media.with_extension("yml")
}

fn py_bool(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

/// Free-text block stored in the container's `comment` tag.
pub fn description_block(meta: &MediaMetadata, subtitles: bool, thumbnail: bool) -> String {
    let mut block = String::new();
    let _ = writeln!(block, "Title: {}", meta.title);
    let _ = writeln!(block, "Author: {}", meta.author);
    let _ = writeln!(
        block,
        "Published: {}",
        meta.publish_date.as_deref().unwrap_or("Unknown")
    );
    let _ = writeln!(block, "Tags: {}", meta.tags.join(", "));
    let _ = writeln!(block, "Age Restricted: {}", py_bool(meta.age_restricted));
    let _ = writeln!(block, "Subtitles: {}", py_bool(subtitles));
    let _ = writeln!(block, "Thumbnail: {}", py_bool(thumbnail));
    let chapters: Vec<String> = meta
        .chapters
        .iter()
        .map(|chapter| format!("{} {}", format_timestamp(chapter.start), chapter.title))
        .collect();
    let _ = writeln!(block, "Chapters: {}", chapters.join("; "));
    let _ = write!(block, "Description: {}", meta.description);
    block
}

fn format_timestamp(millis: u64) -> String {
    let seconds = millis / 1000;
    let (hours, minutes, seconds) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

/// Renders chapter marks as an `FFMETADATA1` document in milliseconds.
/// The last chapter ends at `duration_ms` when known.
pub fn ffmetadata(chapters: &[Chapter], duration_ms: Option<u64>) -> String {
    let mut text = String::from(";FFMETADATA1\n");
    for (index, chapter) in chapters.iter().enumerate() {
        let end = chapters
            .get(index + 1)
            .map(|next| next.start)
            .or(duration_ms)
            .unwrap_or(chapter.start)
            .max(chapter.start);
        let _ = write!(
            text,
            "[CHAPTER]\nTIMEBASE=1/1000\nSTART={}\nEND={}\ntitle={}\n",
            chapter.start,
            end,
            escape_ffmetadata(&chapter.title)
        );
    }
    text
}

fn escape_ffmetadata(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '=' | ';' | '#' | '\\' | '\n') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// A fully resolved muxer invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxJob {
    pub variant: MuxVariant,
    pub args: Vec<OsString>,
    pub output: PathBuf,
}

struct ArgList(Vec<OsString>);

impl ArgList {
    fn push(&mut self, arg: impl Into<OsString>) -> &mut Self {
        self.0.push(arg.into());
        self
    }

    fn pair(&mut self, flag: &str, value: impl Into<OsString>) -> &mut Self {
        self.push(flag).push(value)
    }
}

/// Builds the ffmpeg argument list for `inputs`. Pure; nothing is executed.
pub fn build_mux_job(
    inputs: &MergeInputs,
    meta: &MediaMetadata,
    output: &Path,
) -> Result<MuxJob, MuxError> {
    let variant = MuxVariant::select(inputs.subtitle.is_some(), inputs.thumbnail.is_some());
    let audio_only = inputs.video.is_none();
    if !audio_only && variant == MuxVariant::SubtitleOnly {
        return Err(MuxError::SubtitleWithoutThumbnail);
    }

    let mut args = ArgList(Vec::new());
    args.push("-y").pair("-loglevel", "error");

    let mut next_input = 0usize;
    let mut add_input = |args: &mut ArgList, path: &Path| {
        args.pair("-i", path);
        next_input += 1;
        next_input - 1
    };

    if audio_only {
        let audio = add_input(&mut args, inputs.audio.as_path());
        args.pair("-map", format!("{audio}:a")).pair("-c:a", "copy");
    } else if let Some(video_path) = inputs.video.as_deref() {
        let video = add_input(&mut args, video_path);
        let audio = add_input(&mut args, inputs.audio.as_path());
        let subtitle = match (variant, inputs.subtitle.as_deref()) {
            (MuxVariant::Full, Some(path)) => Some(add_input(&mut args, path)),
            _ => None,
        };
        let chapters = inputs
            .chapters
            .as_deref()
            .map(|path| add_input(&mut args, path));
        let cover = inputs
            .thumbnail
            .as_deref()
            .map(|path| add_input(&mut args, path));

        args.pair("-map", format!("{video}:v:0"))
            .pair("-map", format!("{audio}:a:0"));
        if let Some(cover) = cover {
            args.pair("-map", format!("{cover}:v:0"));
        }
        if let Some(subtitle) = subtitle {
            args.pair("-map", format!("{subtitle}:s:0"));
        }
        if let Some(chapters) = chapters {
            args.pair("-map_metadata", chapters.to_string())
                .pair("-map_chapters", chapters.to_string());
        }
        args.pair("-c:v", "copy").pair("-c:a", "copy");
        if cover.is_some() {
            args.pair("-c:v:1", "png")
                .pair("-disposition:v:1", "attached_pic");
        }
        if subtitle.is_some() {
            args.pair("-c:s", "mov_text")
                .pair("-metadata:s:s:0", format!("title={SUBTITLE_TRACK_TITLE}"));
        }
    }

    let comment = description_block(meta, inputs.subtitle.is_some(), inputs.thumbnail.is_some());
    args.pair("-metadata", format!("artist={}", meta.author))
        .pair("-metadata", format!("title={}", meta.title))
        .pair(
            "-metadata",
            format!("genre={}", meta.publish_date.as_deref().unwrap_or("Unknown")),
        )
        .pair("-metadata", format!("comment={comment}"))
        .push(output);

    Ok(MuxJob {
        variant,
        args: args.0,
        output: output.to_path_buf(),
    })
}

/// Runs a prepared [`MuxJob`].
pub trait MediaMuxer: Send + Sync {
    fn run(&self, job: &MuxJob) -> Result<(), MuxError>;
}

pub struct FfmpegMuxer {
    program: PathBuf,
}

impl Default for FfmpegMuxer {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegMuxer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl MediaMuxer for FfmpegMuxer {
    fn run(&self, job: &MuxJob) -> Result<(), MuxError> {
        let program = self.program.display().to_string();
        let output = Command::new(&self.program)
            .args(&job.args)
            .output()
            .map_err(|source| MuxError::Launch {
                program: program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(MuxError::Failed {
                program,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Result of a completed merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub variant: MuxVariant,
    pub output: PathBuf,
    pub sidecar_written: bool,
}

/// Muxes `inputs` into `output`, removes every intermediate and writes the
/// sidecar unless one already exists.
///
/// Intermediates are removed even when the variant is rejected, so a failed
/// item never leaves temp files behind.
pub fn merge(
    muxer: &dyn MediaMuxer,
    inputs: &MergeInputs,
    meta: &MediaMetadata,
    output: &Path,
) -> Result<MergeOutcome, MuxError> {
    let job = match build_mux_job(inputs, meta, output) {
        Ok(job) => job,
        Err(err) => {
            cleanup(inputs)?;
            return Err(err);
        }
    };
    tracing::debug!(output = %output.display(), variant = ?job.variant, "muxing");
    let muxed = muxer.run(&job);
    cleanup(inputs)?;
    muxed?;

    let sidecar_written = write_sidecar(
        &sidecar_path(output),
        &Sidecar {
            title: meta.title.clone(),
            author: meta.author.clone(),
            description: meta.description.clone(),
            tags: meta.tags.clone(),
            age_restricted: meta.age_restricted,
            publish_date: meta.publish_date.clone(),
            subtitles: inputs.subtitle.is_some(),
            thumbnail: inputs.thumbnail.is_some(),
            chapters: meta.chapters.clone(),
        },
    )?;
    Ok(MergeOutcome {
        variant: job.variant,
        output: output.to_path_buf(),
        sidecar_written,
    })
}

fn cleanup(inputs: &MergeInputs) -> Result<(), MuxError> {
    for path in inputs.intermediates() {
        remove_if_exists(path).map_err(|source| MuxError::Cleanup {
            path: path.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Writes `sidecar` unless the file already holds one. Returns whether a
/// file was written.
pub fn write_sidecar(path: &Path, sidecar: &Sidecar) -> Result<bool, MuxError> {
    let existing: Option<Sidecar> = read_yaml(path).unwrap_or_else(|err| {
        tracing::warn!(path = %path.display(), "unreadable sidecar kept as is: {err:#}");
        None
    });
    if existing.is_some() || path.exists() {
        return Ok(false);
    }
    write_yaml(path, sidecar).map_err(|err| MuxError::Sidecar {
        path: path.to_path_buf(),
        message: format!("{err:#}"),
    })?;
    Ok(true)
}

/// Writes the chapter file for `chapters` at `path`, or nothing when there
/// are no chapters.
pub fn write_chapter_file(
    path: &Path,
    chapters: &[Chapter],
    duration_ms: Option<u64>,
) -> anyhow::Result<Option<PathBuf>> {
    if chapters.is_empty() {
        return Ok(None);
    }
    write_atomic(path, ffmetadata(chapters, duration_ms).as_bytes())?;
    Ok(Some(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::fs;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeMuxer {
        jobs: Mutex<Vec<MuxJob>>,
        fail: bool,
    }

    impl MediaMuxer for FakeMuxer {
        fn run(&self, job: &MuxJob) -> Result<(), MuxError> {
            self.jobs.lock().push(job.clone());
            if self.fail {
                return Err(MuxError::Failed {
                    program: "ffmpeg".into(),
                    status: "exit status: 1".into(),
                    stderr: "boom".into(),
                });
            }
            fs::write(&job.output, b"muxed").map_err(|source| MuxError::Launch {
                program: "fake".into(),
                source,
            })
        }
    }

    fn meta() -> MediaMetadata {
        MediaMetadata {
            title: "Alpha".into(),
            author: "Chan".into(),
            publish_date: Some("2024-01-31".into()),
            tags: vec!["one".into(), "two".into()],
            age_restricted: false,
            description: "About alpha".into(),
            chapters: vec![Chapter {
                start: 0,
                title: "Intro".into(),
            }],
        }
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, name).unwrap();
        path
    }

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|arg| arg.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn variant_selection_covers_all_combinations() {
        assert_eq!(MuxVariant::select(false, false), MuxVariant::Plain);
        assert_eq!(MuxVariant::select(false, true), MuxVariant::Thumbnail);
        assert_eq!(MuxVariant::select(true, false), MuxVariant::SubtitleOnly);
        assert_eq!(MuxVariant::select(true, true), MuxVariant::Full);
    }

    #[test]
    fn thumbnail_only_merge_attaches_cover_without_subtitles() {
        let dir = tempdir().unwrap();
        let inputs = MergeInputs {
            video: Some(touch(dir.path(), "tmp_1.mp4")),
            audio: touch(dir.path(), "tmp_1.m4a"),
            chapters: Some(touch(dir.path(), "tmp_1.ffmeta")),
            subtitle: None,
            thumbnail: Some(touch(dir.path(), "tmp_1.jpg")),
        };
        let output = dir.path().join("out").join("Alpha.mp4");
        fs::create_dir_all(output.parent().unwrap()).unwrap();
        let muxer = FakeMuxer::default();

        let outcome = merge(&muxer, &inputs, &meta(), &output).unwrap();
        assert_eq!(outcome.variant, MuxVariant::Thumbnail);
        assert!(outcome.sidecar_written);

        let jobs = muxer.jobs.lock();
        let args = strings(&jobs[0].args);
        let disposition = args.iter().position(|arg| arg == "-disposition:v:1").unwrap();
        assert_eq!(args[disposition + 1], "attached_pic");
        assert!(!args.iter().any(|arg| arg == "-c:s" || arg.ends_with(":s:0")));
        let comment = args.iter().find(|arg| arg.starts_with("comment=")).unwrap();
        assert!(comment.contains("Subtitles: False"));
        assert!(comment.contains("Thumbnail: True"));
        assert!(args.contains(&"genre=2024-01-31".to_string()));

        for path in inputs.intermediates() {
            assert!(!path.exists(), "{} left behind", path.display());
        }
        let sidecar: Sidecar = read_yaml(&sidecar_path(&output)).unwrap().unwrap();
        assert!(sidecar.thumbnail);
        assert!(!sidecar.subtitles);
        assert_eq!(sidecar.chapters.len(), 1);
    }

    #[test]
    fn full_merge_adds_titled_subtitle_track() {
        let dir = tempdir().unwrap();
        let inputs = MergeInputs {
            video: Some(dir.path().join("v.mp4")),
            audio: dir.path().join("a.m4a"),
            chapters: None,
            subtitle: Some(dir.path().join("s.srt")),
            thumbnail: Some(dir.path().join("t.jpg")),
        };
        let job = build_mux_job(&inputs, &meta(), &dir.path().join("o.mp4")).unwrap();
        let args = strings(&job.args);
        assert_eq!(job.variant, MuxVariant::Full);
        assert!(args.windows(2).any(|w| w[0] == "-c:s" && w[1] == "mov_text"));
        assert!(args.contains(&"title=English Subs".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "2:s:0"));
        assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "3:v:0"));
    }

    #[test]
    fn subtitle_without_cover_fails_and_cleans_up() {
        let dir = tempdir().unwrap();
        let inputs = MergeInputs {
            video: Some(touch(dir.path(), "v.mp4")),
            audio: touch(dir.path(), "a.m4a"),
            chapters: None,
            subtitle: Some(touch(dir.path(), "s.srt")),
            thumbnail: None,
        };
        let muxer = FakeMuxer::default();
        let err = merge(&muxer, &inputs, &meta(), &dir.path().join("o.mp4")).unwrap_err();
        assert!(matches!(err, MuxError::SubtitleWithoutThumbnail));
        assert!(muxer.jobs.lock().is_empty());
        assert!(inputs.intermediates().all(|path| !path.exists()));
    }

    #[test]
    fn audio_only_maps_a_single_stream() {
        let inputs = MergeInputs {
            audio: PathBuf::from("tmp.m4a"),
            ..MergeInputs::default()
        };
        let job = build_mux_job(&inputs, &meta(), Path::new("song.m4a")).unwrap();
        let args = strings(&job.args);
        assert_eq!(args.iter().filter(|arg| *arg == "-i").count(), 1);
        assert!(!args.iter().any(|arg| arg.contains("attached_pic")));
        assert_eq!(args.last().map(String::as_str), Some("song.m4a"));
    }

    #[test]
    fn failed_mux_still_removes_intermediates_and_skips_sidecar() {
        let dir = tempdir().unwrap();
        let inputs = MergeInputs {
            video: Some(touch(dir.path(), "v.mp4")),
            audio: touch(dir.path(), "a.m4a"),
            ..MergeInputs::default()
        };
        let muxer = FakeMuxer {
            fail: true,
            ..FakeMuxer::default()
        };
        let output = dir.path().join("o.mp4");
        assert!(matches!(
            merge(&muxer, &inputs, &meta(), &output),
            Err(MuxError::Failed { .. })
        ));
        assert!(!dir.path().join("v.mp4").exists());
        assert!(!sidecar_path(&output).exists());
    }

    #[test]
    fn existing_sidecar_is_left_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Alpha.yml");
        fs::write(&path, "title: kept\n").unwrap();
        let sidecar = Sidecar {
            title: "new".into(),
            author: String::new(),
            description: String::new(),
            tags: vec![],
            age_restricted: false,
            publish_date: None,
            subtitles: false,
            thumbnail: false,
            chapters: vec![],
        };
        assert!(!write_sidecar(&path, &sidecar).unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "title: kept\n");
    }

    #[test]
    fn ffmetadata_lists_chapters_in_milliseconds() {
        let chapters = vec![
            Chapter {
                start: 0,
                title: "Intro".into(),
            },
            Chapter {
                start: 12_500,
                title: "A=B".into(),
            },
        ];
        let text = ffmetadata(&chapters, Some(90_000));
        assert!(text.starts_with(";FFMETADATA1\n[CHAPTER]\nTIMEBASE=1/1000\nSTART=0\nEND=12500\n"));
        assert!(text.contains("START=12500\nEND=90000\ntitle=A\\=B\n"));
    }

    #[test]
    fn description_block_lists_fields_in_order() {
        let block = description_block(&meta(), false, true);
        assert_eq!(
            block,
            "Title: Alpha\nAuthor: Chan\nPublished: 2024-01-31\nTags: one, two\nAge Restricted: False\nSubtitles: False\nThumbnail: True\nChapters: 0:00 Intro\nDescription: About alpha"
        );
    }
}
