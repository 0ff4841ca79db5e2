// This file is part of vodwatch, a stream-recording batch transcode
// and archival daemon.
// Copyright (C) 2026 The Vodwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! StabilityTracker: fingerprint-based stability detection and promotion
//! (spec §4.3).

use base::clock::Clocks;
use base::Error;
use db::{PendingFile, Store};
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

const CHUNK_SIZE: usize = 64 * 1024;

/// Computes the MD5 fingerprint of a file's full byte content, reading in
/// fixed-size chunks so memory use is bounded regardless of file size
/// (grounded on `original_source`'s `FileUtils::CalcMd5`).
pub fn fingerprint(path: &Path) -> std::io::Result<String> {
    let mut f = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(base::strutil::hex(&hasher.finalize()))
}

pub struct StabilityTracker<'a, C: Clocks + Clone> {
    store: &'a Store<C>,
    threshold: i64,
}

impl<'a, C: Clocks + Clone> StabilityTracker<'a, C> {
    pub fn new(store: &'a Store<C>, threshold: i64) -> Self {
        StabilityTracker { store, threshold }
    }

    /// Observes every path found by the scanner, computing a fresh
    /// fingerprint for each and recording it via `upsert_observation`.
    /// Unreadable paths (deleted mid-scan, permission changes) are logged
    /// and skipped rather than treated as fatal.
    pub fn observe_all(&self, dir_path: &str, filenames: &[String]) {
        for filename in filenames {
            let path = Path::new(dir_path).join(filename);
            let fp = match fingerprint(&path) {
                Ok(fp) => fp,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unable to fingerprint file; skipping");
                    continue;
                }
            };
            match self.store.upsert_observation(dir_path, filename, &fp) {
                Ok(outcome) => debug!(path = %path.display(), ?outcome, "observed"),
                Err(e) => warn!(path = %path.display(), error = %e.chain(), "failed to record observation"),
            }
        }
    }

    /// Promotes every `pending` row whose `stable_count` has reached the
    /// threshold to `stable`, then runs duplicate-extension resolution.
    pub fn promote_stable(&self) -> Result<Vec<PendingFile>, Error> {
        let candidates = self.store.find_stable_with_min_count(self.threshold)?;
        let mut promoted = Vec::with_capacity(candidates.len());
        for f in &candidates {
            self.store.mark_stable(&f.dir_path, &f.filename)?;
            promoted.push(f.clone());
        }
        self.resolve_duplicate_extensions()?;
        Ok(promoted)
    }

    /// Within each directory, if two `stable` files share a filename stem
    /// but differ in extension, deprecates the smaller one — e.g. `X.flv`
    /// alongside `X.mp4` (spec §4.3).
    fn resolve_duplicate_extensions(&self) -> Result<(), Error> {
        let stable = self.store.list_pending_files(Some(db::PendingFileStatus::Stable))?;
        let mut by_stem: HashMap<(String, String), Vec<(&PendingFile, u64)>> = HashMap::new();
        for f in &stable {
            let path = f.filepath();
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(&f.filename)
                .to_owned();
            let len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            by_stem
                .entry((f.dir_path.clone(), stem))
                .or_default()
                .push((f, len));
        }
        for ((_, _), mut group) in by_stem {
            if group.len() < 2 {
                continue;
            }
            group.sort_by_key(|(_, len)| *len);
            let (smallest, _) = group[0];
            self.store.mark_deprecated(&smallest.dir_path, &smallest.filename)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::open_test_store;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn fingerprint_is_stable_across_reads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.flv");
        std::fs::File::create(&path).unwrap().write_all(b"hello world").unwrap();
        let a = fingerprint(&path).unwrap();
        let b = fingerprint(&path).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn promotes_after_threshold_observations() {
        let store = open_test_store();
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.flv");
        std::fs::File::create(&path).unwrap().write_all(b"data").unwrap();
        let tracker = StabilityTracker::new(&store, 3);
        let dir_path = dir.path().to_str().unwrap().to_owned();
        for _ in 0..3 {
            tracker.observe_all(&dir_path, &["a.flv".to_owned()]);
        }
        let promoted = tracker.promote_stable().unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].filename, "a.flv");
    }

    #[test]
    fn duplicate_extension_deprecates_smaller_file() {
        let store = open_test_store();
        let dir = tempdir().unwrap();
        let small = dir.path().join("X.flv");
        let big = dir.path().join("X.mp4");
        std::fs::File::create(&small).unwrap().write_all(&[0u8; 10]).unwrap();
        std::fs::File::create(&big).unwrap().write_all(&[0u8; 20]).unwrap();

        let tracker = StabilityTracker::new(&store, 1);
        let dir_path = dir.path().to_str().unwrap().to_owned();
        tracker.observe_all(&dir_path, &["X.flv".to_owned(), "X.mp4".to_owned()]);
        tracker.promote_stable().unwrap();

        let flv = store.get_pending_file(&dir_path, "X.flv").unwrap().unwrap();
        let mp4 = store.get_pending_file(&dir_path, "X.mp4").unwrap().unwrap();
        assert_eq!(flv.status, db::PendingFileStatus::Deprecated);
        assert_eq!(mp4.status, db::PendingFileStatus::Stable);
    }
}
