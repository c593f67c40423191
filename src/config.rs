#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap},
    env, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::persist::read_yaml;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_WORKERS: usize = 1;
pub const DEFAULT_MAX_SUBMITTED: usize = 2000;
pub const DEFAULT_RETRIES: u32 = 1;
pub const DEFAULT_THROTTLE_SECS: u64 = 5;

/// Resolved runtime settings: where things live and how hard we hit the
/// remote service.
#[derive(Debug, Clone, Default)]
pub struct RuntimeSettings {
    pub archive_root: PathBuf,
    pub nas_root: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub workers: usize,
    pub max_submitted: usize,
    pub retries: u32,
    pub throttle: Duration,
    /// Recorded files missing from disk were removed on purpose.
    pub trust_missing: bool,
}

impl RuntimeSettings {
    /// Root the media tree is written to for this run.
    pub fn media_root(&self, use_nas: bool) -> Result<&Path> {
        if !use_nas {
            return Ok(&self.archive_root);
        }
        self.nas_root
            .as_deref()
            .ok_or_else(|| anyhow!("--nas requested but ARCHIVE_NAS_ROOT is not set"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub archive_root: Option<PathBuf>,
    pub nas_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub workers: Option<usize>,
    pub max_submitted: Option<usize>,
    pub retries: Option<u32>,
    pub throttle_secs: Option<u64>,
    pub env_path: Option<PathBuf>,
    pub trust_missing: Option<bool>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_settings(&file_vars, env_var_string, overrides)
}

fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let archive_root = overrides
        .archive_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("ARCHIVE_ROOT", file_vars, &env_lookup))
        .ok_or_else(|| anyhow!("ARCHIVE_ROOT not set (use --path or the .env file)"))?;
    let nas_root = overrides
        .nas_root
        .or_else(|| lookup_value("ARCHIVE_NAS_ROOT", file_vars, &env_lookup).map(PathBuf::from));
    let data_dir = overrides
        .data_dir
        .or_else(|| lookup_value("ARCHIVE_DATA_DIR", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let workers = overrides
        .workers
        .or_else(|| parse_lookup("ARCHIVE_WORKERS", file_vars, &env_lookup))
        .unwrap_or(DEFAULT_WORKERS);
    if workers == 0 {
        bail!("worker count must be at least 1");
    }
    let max_submitted = overrides
        .max_submitted
        .or_else(|| parse_lookup("ARCHIVE_MAX_SUBMITTED", file_vars, &env_lookup))
        .unwrap_or(DEFAULT_MAX_SUBMITTED);
    let retries = overrides
        .retries
        .or_else(|| parse_lookup("ARCHIVE_RETRIES", file_vars, &env_lookup))
        .unwrap_or(DEFAULT_RETRIES);
    let throttle_secs = overrides
        .throttle_secs
        .or_else(|| parse_lookup("ARCHIVE_THROTTLE_SECS", file_vars, &env_lookup))
        .unwrap_or(DEFAULT_THROTTLE_SECS);
    let trust_missing = overrides
        .trust_missing
        .or_else(|| lookup_value("ARCHIVE_TRUST_MISSING", file_vars, &env_lookup).map(|raw| is_truthy(&raw)))
        .unwrap_or(false);

    Ok(RuntimeSettings {
        archive_root: PathBuf::from(archive_root),
        nas_root,
        data_dir,
        workers,
        max_submitted,
        retries,
        throttle: Duration::from_secs(throttle_secs),
        trust_missing,
    })
}

fn is_truthy(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_lookup<T: std::str::FromStr>(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<T> {
    let raw = lookup_value(key, file_vars, env_lookup)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().map(|value| value.trim().to_string())
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

/// Reads `KEY=value` lines. Values may be wrapped in single or double
/// quotes; a missing file yields no variables.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim(), unquote(value.trim())))
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect())
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .iter()
        .find_map(|quote| value.strip_prefix(*quote)?.strip_suffix(*quote))
        .unwrap_or(value)
}

/// Whether a collection is a channel or a playlist.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    Channel,
    Playlist,
}

/// One entry of the collections file (`data.yml`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub channel: bool,
    /// Audio only; the key name is kept from older config files.
    #[serde(default, rename = "mp3")]
    pub audio_only: bool,
    /// Prefix file names with `[<channel>] - `.
    #[serde(default)]
    pub add_channel: bool,
    /// Prefix file names with the zero-padded playlist position.
    #[serde(default)]
    pub count: bool,
}

impl CollectionConfig {
    pub fn kind(&self) -> CollectionKind {
        if self.channel {
            CollectionKind::Channel
        } else {
            CollectionKind::Playlist
        }
    }

    /// Collection-relative directory, as recorded in the manifest.
    pub fn relative_location(&self) -> String {
        match self.location.as_deref().map(str::trim) {
            Some(location) if !location.is_empty() => {
                Path::new(location).join(&self.name).to_string_lossy().into_owned()
            }
            _ => self.name.clone(),
        }
    }

    pub fn output_dir(&self, media_root: &Path) -> PathBuf {
        media_root.join(self.relative_location())
    }

    /// The url to list entries from. Channels are listed through their
    /// uploads tab.
    pub fn listing_url(&self) -> String {
        match self.kind() {
            CollectionKind::Channel => build_channel_list_url(&self.url),
            CollectionKind::Playlist => self.url.clone(),
        }
    }

    pub fn media_extension(&self) -> &'static str {
        if self.audio_only { "m4a" } else { "mp4" }
    }
}

/// Appends `/videos` to a channel url unless it already points there, keeping
/// any query or fragment intact.
pub fn build_channel_list_url(channel_url: &str) -> String {
    let (without_fragment, fragment) = match channel_url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (channel_url, None),
    };
    let (base, query) = match without_fragment.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (without_fragment, None),
    };

    let base = base.trim_end_matches('/');
    let mut result = if base.ends_with("/videos") {
        base.to_string()
    } else {
        format!("{base}/videos")
    };

    if let Some(query) = query {
        result.push('?');
        result.push_str(query);
    }
    if let Some(fragment) = fragment {
        result.push('#');
        result.push_str(fragment);
    }

    result
}

/// Entry of the ignore file (`ignore.yml`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoreEntry {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Reads the ordered collection list. Duplicate names are rejected because
/// the name keys the manifest file.
pub fn load_collections(path: &Path) -> Result<Vec<CollectionConfig>> {
    let collections: Vec<CollectionConfig> = read_yaml(path)?
        .ok_or_else(|| anyhow!("collections file {} is missing or empty", path.display()))?;
    let mut seen = BTreeSet::new();
    for collection in &collections {
        if collection.name.trim().is_empty() {
            bail!("collection with url {} has an empty name", collection.url);
        }
        if !seen.insert(collection.name.as_str()) {
            bail!("collection {} is listed more than once", collection.name);
        }
    }
    Ok(collections)
}

/// Reads the ignore list; a missing file means nothing is ignored.
pub fn load_ignore_list(path: &Path) -> Result<Vec<IgnoreEntry>> {
    Ok(read_yaml(path)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> RuntimeSettings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_settings(&vars, |_| None, RuntimeOverrides::default()).unwrap()
    }

    #[test]
    fn settings_use_defaults() {
        let settings = settings_from("ARCHIVE_ROOT=\"/yt\"\n");
        assert_eq!(settings.archive_root, PathBuf::from("/yt"));
        assert_eq!(settings.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
        assert_eq!(settings.workers, DEFAULT_WORKERS);
        assert_eq!(settings.max_submitted, DEFAULT_MAX_SUBMITTED);
        assert_eq!(settings.retries, DEFAULT_RETRIES);
        assert_eq!(settings.throttle, Duration::from_secs(DEFAULT_THROTTLE_SECS));
        assert!(settings.nas_root.is_none());
    }

    #[test]
    fn settings_read_numeric_values() {
        let settings = settings_from(
            "ARCHIVE_ROOT=/yt\nARCHIVE_WORKERS=3\nARCHIVE_MAX_SUBMITTED='10'\nARCHIVE_THROTTLE_SECS=0\n",
        );
        assert_eq!(settings.workers, 3);
        assert_eq!(settings.max_submitted, 10);
        assert_eq!(settings.throttle, Duration::ZERO);
    }

    #[test]
    fn settings_invalid_number_defaults() {
        let settings = settings_from("ARCHIVE_ROOT=/yt\nARCHIVE_WORKERS=lots\n");
        assert_eq!(settings.workers, DEFAULT_WORKERS);
    }

    #[test]
    fn settings_require_archive_root() {
        let err = build_settings(&HashMap::new(), |_| None, RuntimeOverrides::default())
            .unwrap_err();
        assert!(err.to_string().contains("ARCHIVE_ROOT"));
    }

    #[test]
    fn settings_reject_zero_workers() {
        let overrides = RuntimeOverrides {
            archive_root: Some("/yt".into()),
            workers: Some(0),
            ..RuntimeOverrides::default()
        };
        assert!(build_settings(&HashMap::new(), |_| None, overrides).is_err());
    }

    #[test]
    fn settings_override_precedence() {
        let mut vars = HashMap::new();
        vars.insert("ARCHIVE_ROOT".to_string(), "/file-root".to_string());
        vars.insert("ARCHIVE_NAS_ROOT".to_string(), "/file-nas".to_string());
        vars.insert("ARCHIVE_WORKERS".to_string(), "2".to_string());

        let overrides = RuntimeOverrides {
            archive_root: Some(PathBuf::from("/override-root")),
            workers: Some(4),
            ..RuntimeOverrides::default()
        };

        let settings = build_settings(
            &vars,
            |key| {
                if key == "ARCHIVE_NAS_ROOT" {
                    Some("/env-nas".to_string())
                } else {
                    None
                }
            },
            overrides,
        )
        .unwrap();

        assert_eq!(settings.archive_root, PathBuf::from("/override-root"));
        assert_eq!(settings.nas_root, Some(PathBuf::from("/env-nas")));
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.media_root(true).unwrap(), Path::new("/env-nas"));
        assert_eq!(settings.media_root(false).unwrap(), Path::new("/override-root"));
    }

    #[test]
    fn media_root_requires_nas_root_when_requested() {
        let settings = settings_from("ARCHIVE_ROOT=/yt\n");
        assert!(settings.media_root(true).is_err());
    }

    #[test]
    fn read_env_file_handles_quotes_and_comments() {
        let cfg = make_config(
            r#"
            ARCHIVE_ROOT="/media"
            ARCHIVE_NAS_ROOT='/nas'
            ARCHIVE_WORKERS =  "2"
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("ARCHIVE_ROOT").unwrap(), "/media");
        assert_eq!(vars.get("ARCHIVE_NAS_ROOT").unwrap(), "/nas");
        assert_eq!(vars.get("ARCHIVE_WORKERS").unwrap(), "2");
        assert!(!vars.contains_key("INVALID_LINE"));
        assert_eq!(vars.len(), 3);
    }

    #[test]
    fn trust_missing_reads_setting_and_override() {
        assert!(!settings_from("ARCHIVE_ROOT=/yt\n").trust_missing);
        assert!(settings_from("ARCHIVE_ROOT=/yt\nARCHIVE_TRUST_MISSING=yes\n").trust_missing);
        assert!(!settings_from("ARCHIVE_ROOT=/yt\nARCHIVE_TRUST_MISSING=0\n").trust_missing);

        let mut vars = HashMap::new();
        vars.insert("ARCHIVE_ROOT".to_string(), "/yt".to_string());
        vars.insert("ARCHIVE_TRUST_MISSING".to_string(), "false".to_string());
        let overrides = RuntimeOverrides {
            trust_missing: Some(true),
            ..RuntimeOverrides::default()
        };
        assert!(build_settings(&vars, |_| None, overrides).unwrap().trust_missing);
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn collections_file_applies_defaults() {
        let cfg = make_config(
            r#"
- name: Favourites
  url: https://www.youtube.com/playlist?list=PL1
- name: Talks
  url: https://www.youtube.com/@talks/
  location: lectures
  channel: true
  mp3: true
  add_channel: true
  count: true
"#,
        );
        let collections = load_collections(cfg.path()).unwrap();
        assert_eq!(collections.len(), 2);
        let first = &collections[0];
        assert_eq!(first.kind(), CollectionKind::Playlist);
        assert!(!first.audio_only && !first.add_channel && !first.count);
        assert_eq!(first.relative_location(), "Favourites");
        assert_eq!(first.listing_url(), "https://www.youtube.com/playlist?list=PL1");
        assert_eq!(first.media_extension(), "mp4");

        let second = &collections[1];
        assert_eq!(second.kind(), CollectionKind::Channel);
        assert!(second.audio_only && second.add_channel && second.count);
        assert_eq!(second.relative_location(), "lectures/Talks");
        assert_eq!(second.listing_url(), "https://www.youtube.com/@talks/videos");
        assert_eq!(
            second.output_dir(Path::new("/yt")),
            PathBuf::from("/yt/lectures/Talks")
        );
        assert_eq!(second.media_extension(), "m4a");
    }

    #[test]
    fn collections_file_rejects_duplicate_names() {
        let cfg = make_config("- {name: A, url: u1}\n- {name: A, url: u2}\n");
        let err = load_collections(cfg.path()).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn ignore_list_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_ignore_list(&dir.path().join("ignore.yml")).unwrap().is_empty());
        let cfg = make_config("- url: https://youtube.com/watch?v=A\n  reason: dup\n- url: https://youtube.com/watch?v=B\n");
        let entries = load_ignore_list(cfg.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].reason.as_deref(), Some("dup"));
        assert!(entries[1].reason.is_none());
    }

    #[test]
    fn channel_list_url_keeps_query_and_fragment() {
        assert_eq!(
            build_channel_list_url("https://youtube.com/@c/videos/"),
            "https://youtube.com/@c/videos"
        );
        assert_eq!(
            build_channel_list_url("https://youtube.com/@c?x=1#top"),
            "https://youtube.com/@c/videos?x=1#top"
        );
    }
}
