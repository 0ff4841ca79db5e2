// This file is part of vodwatch, a stream-recording batch transcode
// and archival daemon.
// Copyright (C) 2026 The Vodwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Filesystem scanning: walks each configured root, pruning rejected
//! directories and filtering files by extension and allow/deny rules
//! (spec §4.2).

use crate::config::RootConfig;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

pub struct Scanner {
    extensions: Vec<String>,
    allow_list: Option<Regex>,
    deny_list: Option<Regex>,
    simple_allow_list: Option<String>,
    simple_deny_list: Option<String>,
}

impl Scanner {
    pub fn new(cfg: &crate::config::ScannerConfig) -> Result<Self, base::Error> {
        let compile = |pattern: &Option<String>| -> Result<Option<Regex>, base::Error> {
            pattern
                .as_ref()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        base::format_err_t!(InvalidArgument, format!("invalid regex {:?}: {}", p, e))
                    })
                })
                .transpose()
        };
        Ok(Scanner {
            extensions: cfg.extensions.iter().map(|e| e.to_lowercase()).collect(),
            allow_list: compile(&cfg.allow_list)?,
            deny_list: compile(&cfg.deny_list)?,
            simple_allow_list: cfg.simple_allow_list.clone(),
            simple_deny_list: cfg.simple_deny_list.clone(),
        })
    }

    /// Walks `root.path`, returning a map from directory path (as a string)
    /// to the filenames found directly within it that pass every filter.
    /// Rejected directories are pruned via `filter_entry` rather than
    /// descended into; permission-denied entries are logged and skipped
    /// rather than treated as fatal.
    pub fn scan(&self, root: &RootConfig) -> HashMap<String, Vec<String>> {
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        let walker = WalkDir::new(&root.path)
            .into_iter()
            .filter_entry(|e| self.entry_allowed(e, root));
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable directory entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if !self.file_accepted(entry.path(), root) {
                continue;
            }
            let Some(parent) = entry.path().parent() else {
                continue;
            };
            let Some(filename) = entry.path().file_name().and_then(|f| f.to_str()) else {
                continue;
            };
            out.entry(parent.to_string_lossy().into_owned())
                .or_default()
                .push(filename.to_owned());
        }
        out
    }

    fn entry_allowed(&self, entry: &DirEntry, root: &RootConfig) -> bool {
        if !entry.file_type().is_dir() {
            return true;
        }
        if entry.depth() == 0 {
            return true;
        }
        let Some(name) = entry.file_name().to_str() else {
            return false;
        };
        root.filter.accepts(name)
    }

    fn file_accepted(&self, path: &Path, root: &RootConfig) -> bool {
        let Some(filename) = path.file_name().and_then(|f| f.to_str()) else {
            return false;
        };
        let ext_ok = self
            .extensions
            .iter()
            .any(|e| filename.to_lowercase().ends_with(e.as_str()));
        if !ext_ok {
            return false;
        }
        if !root.filter.accepts(filename) {
            return false;
        }
        if let Some(re) = &self.allow_list {
            if !re.is_match(filename) {
                return false;
            }
        }
        if let Some(re) = &self.deny_list {
            if re.is_match(filename) {
                return false;
            }
        }
        if let Some(needle) = &self.simple_allow_list {
            if !filename.contains(needle.as_str()) {
                return false;
            }
        }
        if let Some(needle) = &self.simple_deny_list {
            if filename.contains(needle.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScannerConfig;
    use crate::filter::FilterConfig;
    use std::fs;
    use tempfile::tempdir;

    fn scanner_config(extensions: &[&str]) -> ScannerConfig {
        ScannerConfig {
            video_roots: vec![],
            extensions: extensions.iter().map(|s| s.to_string()).collect(),
            allow_list: None,
            deny_list: None,
            simple_allow_list: None,
            simple_deny_list: None,
        }
    }

    fn root(path: impl Into<std::path::PathBuf>) -> RootConfig {
        RootConfig {
            path: path.into(),
            filter: FilterConfig::default(),
            enable_delete: false,
            delete_mode: crate::filter::FilterMode::Blacklist,
            delete_rules: vec![],
        }
    }

    #[test]
    fn finds_files_matching_extension() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.flv"), b"x").unwrap();
        fs::write(dir.path().join("a.txt"), b"x").unwrap();
        let scanner = Scanner::new(&scanner_config(&[".flv"])).unwrap();
        let found = scanner.scan(&root(dir.path()));
        let files = &found[&dir.path().to_string_lossy().into_owned()];
        assert_eq!(files, &vec!["a.flv".to_owned()]);
    }

    #[test]
    fn prunes_rejected_subdirectories() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("skip")).unwrap();
        fs::write(dir.path().join("skip/a.flv"), b"x").unwrap();
        fs::write(dir.path().join("keep.flv"), b"x").unwrap();

        let mut r = root(dir.path());
        r.filter = FilterConfig {
            filter_mode: crate::filter::FilterMode::Blacklist,
            rules: vec![crate::filter::FilterRule {
                rule_type: crate::filter::RuleType::Exact,
                pattern: "skip".to_owned(),
            }],
        };
        let scanner = Scanner::new(&scanner_config(&[".flv"])).unwrap();
        let found = scanner.scan(&r);
        let total: usize = found.values().map(|v| v.len()).sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn simple_deny_list_substring_match_is_case_sensitive() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("private_clip.flv"), b"x").unwrap();
        fs::write(dir.path().join("public_clip.flv"), b"x").unwrap();
        let mut cfg = scanner_config(&[".flv"]);
        cfg.simple_deny_list = Some("private".to_owned());
        let scanner = Scanner::new(&cfg).unwrap();
        let found = scanner.scan(&root(dir.path()));
        let files = &found[&dir.path().to_string_lossy().into_owned()];
        assert_eq!(files, &vec!["public_clip.flv".to_owned()]);
    }
}
