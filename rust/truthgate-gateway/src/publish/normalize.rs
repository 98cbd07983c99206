//! Relative-path normalization for uploaded site files.
//!
//! Hostile field names are the norm here: traversal dressed up in percent
//! encoding or Unicode lookalikes must die before any path reaches MFS.

use std::collections::BTreeSet;

use percent_encoding::percent_decode_str;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("empty path")]
    Empty,
    #[error("disallowed path segment {0:?}")]
    DisallowedSegment(String),
    #[error("duplicate path after normalization: {0}")]
    Duplicate(String),
    #[error("no root-level index.html after normalization")]
    MissingIndex,
}

/// Normalize one relative path: map backslashes, strip leading `./` and
/// `/`, collapse duplicate separators, and reject dot segments (including
/// percent-decoded and NFKC-normalized spellings), control characters and
/// `:`. Idempotent.
pub fn normalize_relative_path(raw: &str) -> Result<String, NormalizeError> {
    let mapped = raw.replace('\\', "/");
    let mut segments = Vec::new();

    for segment in mapped.split('/') {
        if segment.is_empty() {
            continue;
        }
        if segment == "." && segments.is_empty() {
            // A leading `./` is tolerated and dropped.
            continue;
        }
        reject_dot_segment(segment)?;
        if segment
            .chars()
            .any(|ch| ch.is_control() || ch == ':')
        {
            return Err(NormalizeError::DisallowedSegment(segment.to_string()));
        }
        segments.push(segment);
    }

    if segments.is_empty() {
        return Err(NormalizeError::Empty);
    }
    Ok(segments.join("/"))
}

fn reject_dot_segment(segment: &str) -> Result<(), NormalizeError> {
    let decoded = percent_decode_str(segment).decode_utf8_lossy();
    let folded: String = decoded.nfkc().collect();
    for view in [segment, decoded.as_ref(), folded.as_str()] {
        if view == "." || view == ".." {
            return Err(NormalizeError::DisallowedSegment(segment.to_string()));
        }
    }
    Ok(())
}

/// The set-level folding applied once every uploaded path is known.
#[derive(Debug, PartialEq, Eq)]
pub enum SetFold {
    /// Keys were already rooted.
    None,
    /// Every file lived under one common folder, now stripped.
    StripCommon(String),
    /// The lone `<folder>/index.html` subtree was hoisted to the root.
    HoistFolder(String),
}

/// Apply the publish rules to the full key set:
///
/// 1. strip a common first folder shared by every file (unless that folder
///    is literally `index.html`);
/// 2. failing a root `index.html`, hoist the folder holding the single
///    `<folder>/index.html`;
/// 3. require a root `index.html` afterwards.
///
/// Returns the final keys (same order) and which fold was applied.
pub fn normalize_file_set(keys: &[String]) -> Result<(Vec<String>, SetFold), NormalizeError> {
    if keys.is_empty() {
        return Err(NormalizeError::MissingIndex);
    }

    let mut result: Vec<String> = keys.to_vec();
    let mut fold = SetFold::None;

    if let Some(common) = common_first_folder(&result) {
        if common != "index.html" {
            result = result
                .iter()
                .map(|key| key[common.len() + 1..].to_string())
                .collect();
            fold = SetFold::StripCommon(common);
        }
    }

    if !has_root_index(&result) {
        let candidates: Vec<String> = result
            .iter()
            .filter_map(|key| {
                let (folder, rest) = key.split_once('/')?;
                (rest.eq_ignore_ascii_case("index.html")).then(|| folder.to_string())
            })
            .collect();
        if candidates.len() == 1 {
            let folder = candidates.into_iter().next().unwrap();
            let prefix = format!("{}/", folder);
            result = result
                .iter()
                .map(|key| match key.strip_prefix(&prefix) {
                    Some(rest) => rest.to_string(),
                    None => key.clone(),
                })
                .collect();
            fold = SetFold::HoistFolder(folder);
        }
    }

    let mut seen = BTreeSet::new();
    for key in result.iter() {
        if !seen.insert(key.clone()) {
            return Err(NormalizeError::Duplicate(key.clone()));
        }
    }
    if !has_root_index(&result) {
        return Err(NormalizeError::MissingIndex);
    }
    Ok((result, fold))
}

fn has_root_index(keys: &[String]) -> bool {
    keys.iter()
        .any(|key| key.eq_ignore_ascii_case("index.html"))
}

fn common_first_folder(keys: &[String]) -> Option<String> {
    let mut folders = keys.iter().map(|key| key.split_once('/').map(|(f, _)| f));
    let first = folders.next()??;
    for folder in folders {
        if folder != Some(first) {
            return None;
        }
    }
    Some(first.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_path_normalization_cleans_separators() {
        assert_eq!(
            normalize_relative_path("wwwroot\\assets\\logo.png").unwrap(),
            "wwwroot/assets/logo.png"
        );
        assert_eq!(normalize_relative_path("./a//b/c.txt").unwrap(), "a/b/c.txt");
        assert_eq!(normalize_relative_path("/rooted.html").unwrap(), "rooted.html");
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in ["wwwroot\\app.js", "./x//y.png", "/deep/path/file.css"] {
            let once = normalize_relative_path(raw).unwrap();
            let twice = normalize_relative_path(&once).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn traversal_spellings_are_rejected() {
        for raw in [
            "../secret",
            "a/../b",
            "a/%2e%2e/b",
            "a/%2E%2E/b",
            "a/\u{ff0e}\u{ff0e}/b", // fullwidth dots fold to ".." under NFKC
            "a/./b",
        ] {
            assert!(normalize_relative_path(raw).is_err(), "{:?}", raw);
        }
    }

    #[test]
    fn control_chars_and_colons_are_rejected() {
        assert!(normalize_relative_path("a\u{0007}.txt").is_err());
        assert!(normalize_relative_path("c:stream.txt").is_err());
    }

    #[test]
    fn common_folder_is_stripped() {
        let keys = vec![
            "wwwroot/index.html".to_string(),
            "wwwroot/app.js".to_string(),
            "wwwroot/assets/logo.png".to_string(),
        ];
        let (result, fold) = normalize_file_set(&keys).unwrap();
        assert_eq!(result, vec!["index.html", "app.js", "assets/logo.png"]);
        assert_eq!(fold, SetFold::StripCommon("wwwroot".into()));
    }

    #[test]
    fn lone_index_subtree_is_hoisted() {
        let keys = vec![
            "site/index.html".to_string(),
            "site/app.js".to_string(),
            "README.txt".to_string(),
        ];
        let (result, fold) = normalize_file_set(&keys).unwrap();
        assert_eq!(result, vec!["index.html", "app.js", "README.txt"]);
        assert_eq!(fold, SetFold::HoistFolder("site".into()));
    }

    #[test]
    fn sets_without_an_index_are_rejected() {
        let keys = vec!["app.js".to_string(), "style.css".to_string()];
        assert_eq!(
            normalize_file_set(&keys).unwrap_err(),
            NormalizeError::MissingIndex
        );
    }

    #[test]
    fn a_root_index_survives_as_is() {
        let keys = vec!["index.html".to_string(), "app.js".to_string()];
        let (result, fold) = normalize_file_set(&keys).unwrap();
        assert_eq!(result, keys);
        assert_eq!(fold, SetFold::None);
    }
}
