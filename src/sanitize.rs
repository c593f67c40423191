#![forbid(unsafe_code)]

//! Turns video titles into filenames that survive every filesystem we mirror
//! onto, and compares those names against what a directory listing returns.
//!
//! Sanitizing is lossy on purpose: two titles may collapse onto the same
//! name, which is why the manifest (not the disk) decides what has been
//! downloaded. The helpers here are only used for naming new files and for
//! matching titles against existing ones.

use std::borrow::Cow;

use unicode_normalization::UnicodeNormalization;

/// Longest filename stem we ever produce, counted in characters.
pub const MAX_FILENAME_CHARS: usize = 255;

/// Characters stripped by the current sanitizer.
const BANNED: &[char] = &['"', '*', '.', '/', ':', '<', '>', '?', '\\', '|'];

/// Extra characters the first generation of the archive also stripped. Kept
/// so old files can be recognised and renamed.
const LEGACY_EXTRA: &[char] = &['#', '$', '%', '\'', ',', ';', '^', '~'];

/// Which banned set to apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Charset {
    #[default]
    Current,
    Legacy,
}

impl Charset {
    fn bans(self, c: char) -> bool {
        // Code points 0..=30 are dropped; 31 (unit separator) never was.
        if (c as u32) < 31 {
            return true;
        }
        match self {
            Charset::Current => BANNED.contains(&c),
            Charset::Legacy => BANNED.contains(&c) || LEGACY_EXTRA.contains(&c),
        }
    }
}

/// Removes control characters and the banned set, then caps the result at
/// [`MAX_FILENAME_CHARS`].
pub fn sanitize(title: &str, charset: Charset) -> String {
    let cleaned: String = title.chars().filter(|c| !charset.bans(*c)).collect();
    truncate_chars(&cleaned, MAX_FILENAME_CHARS)
}

/// Title pre-translation applied before [`sanitize`] when naming files: a
/// handful of separators vanish and double quotes become underscores.
pub fn title_safe(title: &str, charset: Charset) -> String {
    let translated: String = title
        .chars()
        .filter_map(|c| match c {
            '/' | ':' | '*' | '<' | '>' | '|' | '?' => None,
            '"' => Some('_'),
            other => Some(other),
        })
        .collect();
    sanitize(&translated, charset)
}

/// Keeps the first `max` characters; words are cut wherever the limit
/// falls, matching the names already on disk.
fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((cut, _)) => value[..cut].to_string(),
        None => value.to_string(),
    }
}

/// Canonical-composition form used when comparing names, so decomposed
/// listings (as returned by some POSIX filesystems) match composed titles.
pub fn normalize_name(name: &str, enabled: bool) -> Cow<'_, str> {
    if !enabled || name.is_ascii() {
        return Cow::Borrowed(name);
    }
    Cow::Owned(name.nfc().collect())
}

/// Whether names should go through NFC before comparison on this host.
pub fn default_unicode_normalization() -> bool {
    cfg!(unix)
}
