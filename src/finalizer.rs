// This file is part of vodwatch, a stream-recording batch transcode
// and archival daemon.
// Copyright (C) 2026 The Vodwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! BatchFinalizer: concat-merges a batch's encoded fragments into one AV1
//! MP4, extracts an MP3, and flips the batch (and its source files) to their
//! terminal state (spec §4.6).

use crate::config::{AppConfig, RootConfig};
use crate::encoder::{run_concat, run_extract_mp3};
use crate::filename::parse_time;
use crate::filter::FilterConfig;
use base::clock::Clocks;
use base::Error;
use db::{BatchFileStatus, Store};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub struct BatchFinalizer<'a, C: Clocks + Clone> {
    store: &'a Store<C>,
    ffmpeg_path: String,
}

impl<'a, C: Clocks + Clone> BatchFinalizer<'a, C> {
    pub fn new(store: &'a Store<C>, ffmpeg_path: String) -> Self {
        BatchFinalizer { store, ffmpeg_path }
    }

    /// Finalizes every batch the Store considers complete-and-quiescent,
    /// per `find_complete_batch_ids`. A failure in one batch is logged and
    /// transitions that batch to `failed`; it never aborts the sweep.
    pub async fn sweep(&self, quiescence_seconds: i64, cfg: &AppConfig) -> Result<(), Error> {
        for batch_id in self.store.find_complete_batch_ids(quiescence_seconds)? {
            if let Err(e) = self.finalize_one(batch_id, cfg).await {
                warn!(batch_id, error = %e.chain(), "finalizing batch failed; marking failed");
                let _ = self.store.fail_batch(batch_id);
            }
        }
        Ok(())
    }

    async fn finalize_one(&self, batch_id: i64, cfg: &AppConfig) -> Result<(), Error> {
        self.store
            .set_batch_status(batch_id, db::BatchStatus::Encoding, db::BatchStatus::Merging)?;
        let batch = self
            .store
            .get_batch(batch_id)?
            .ok_or_else(|| base::format_err_t!(NotFound, format!("batch {} vanished", batch_id)))?;

        let encoded = self
            .store
            .list_batch_files_with_status(batch_id, BatchFileStatus::Encoded)?;
        if encoded.is_empty() {
            base::bail_t!(FailedPrecondition, "batch {} has no encoded files to merge", batch_id);
        }

        let merged_path = if encoded.len() == 1 {
            PathBuf::from(encoded[0].encoded_path.as_deref().unwrap_or_default())
        } else {
            let mut manifest = String::new();
            for f in &encoded {
                let p = f.encoded_path.as_deref().unwrap_or_default();
                writeln!(manifest, "file '{p}'").ok();
            }
            let manifest_path = Path::new(&batch.tmp_dir).join("concat.txt");
            std::fs::write(&manifest_path, manifest)
                .map_err(|e| base::format_err_t!(Internal, format!("writing concat manifest: {}", e)))?;
            std::fs::create_dir_all(&batch.output_dir)
                .map_err(|e| base::format_err_t!(Internal, format!("creating output dir: {}", e)))?;
            let out = Path::new(&batch.output_dir).join(format!("merged_{}", encoded[0].filename));
            run_concat(&self.ffmpeg_path, &manifest_path, &out).await?;
            out
        };

        self.store
            .set_batch_status(batch_id, db::BatchStatus::Merging, db::BatchStatus::ExtractingMp3)?;

        std::fs::create_dir_all(&batch.output_dir)
            .map_err(|e| base::format_err_t!(Internal, format!("creating output dir: {}", e)))?;
        let mp3_name = merged_path.file_stem().and_then(|s| s.to_str()).unwrap_or("merged");
        let mp3_path = Path::new(&batch.output_dir).join(format!("{mp3_name}.mp3"));
        run_extract_mp3(&self.ffmpeg_path, &merged_path, &mp3_path).await?;

        self.store.set_batch_final_paths(
            batch_id,
            Some(&merged_path.to_string_lossy()),
            Some(&mp3_path.to_string_lossy()),
        )?;

        let times: Vec<_> = encoded.iter().filter_map(|f| parse_time(&f.filename)).collect();
        let start = times.iter().min_by_key(|t| t.timestamp());
        let end = times.iter().max_by_key(|t| t.timestamp());
        let start_s = start.map(|t| t.timestamp().to_string()).unwrap_or_default();
        let end_s = end.map(|t| t.timestamp().to_string()).unwrap_or_default();
        self.store.complete_batch(batch_id, &start_s, &end_s)?;

        info!(batch_id, mp4 = %merged_path.display(), mp3 = %mp3_path.display(), "batch finalized");

        for f in &encoded {
            if should_delete_original(cfg, &f.dir_path, &f.filename) {
                let path = f.filepath();
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to delete original after completion");
                }
            }
        }

        Ok(())
    }
}

/// Finds the configured root owning `dir_path`, if any.
fn owning_root<'a>(cfg: &'a AppConfig, dir_path: &str) -> Option<&'a RootConfig> {
    cfg.scanner
        .video_roots
        .iter()
        .find(|r| Path::new(dir_path).starts_with(&r.path))
}

/// The first path component of `dir_path/filename` below the owning root,
/// against which per-root delete rules are evaluated (spec §4.6).
fn first_component_under_root(root: &RootConfig, dir_path: &str, filename: &str) -> String {
    let full = Path::new(dir_path).join(filename);
    match full.strip_prefix(&root.path) {
        Ok(rel) => rel
            .components()
            .next()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.to_owned()),
        Err(_) => filename.to_owned(),
    }
}

/// spec §4.6: delete iff the owning root opts in and its delete rules
/// accept the file, or (no root anywhere opts in and the global
/// `keep_original` flag is false).
fn should_delete_original(cfg: &AppConfig, dir_path: &str, filename: &str) -> bool {
    if let Some(root) = owning_root(cfg, dir_path) {
        if root.enable_delete {
            let component = first_component_under_root(root, dir_path, filename);
            let filt = FilterConfig {
                filter_mode: root.delete_mode,
                rules: root.delete_rules.clone(),
            };
            return filt.accepts(&component);
        }
    }
    let any_root_configured = cfg.scanner.video_roots.iter().any(|r| r.enable_delete);
    !any_root_configured && !cfg.output.keep_original
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncoderConfig, OutputConfig, SchedulerConfig, ScannerConfig, TempConfig};
    use crate::filter::{FilterMode, FilterRule, RuleType};
    use db::{BatchStatus, NewBatchFile};
    use std::io::Write;
    use tempfile::tempdir;

    fn cfg_with_roots(roots: Vec<RootConfig>, keep_original: bool) -> AppConfig {
        AppConfig {
            scanner: ScannerConfig {
                video_roots: roots,
                extensions: vec![".flv".into()],
                allow_list: None,
                deny_list: None,
                simple_allow_list: None,
                simple_deny_list: None,
            },
            output: OutputConfig {
                output_root: "/out".into(),
                keep_original,
            },
            scheduler: SchedulerConfig {
                scan_interval_seconds: 30,
                merge_window_hours: 1.0,
                stability_threshold: 3,
                quiescence_seconds: 0,
            },
            temp: TempConfig {
                temp_dir: "/tmp/vodwatch".into(),
                size_limit_mb: None,
            },
            encoder: EncoderConfig {
                max_parallel: 2,
                max_retries: 2,
                crf: 30,
                preset: 6,
                ffmpeg_path: "ffmpeg".into(),
                shutdown_grace_seconds: 10,
            },
        }
    }

    #[test]
    fn deletes_by_default_when_nothing_configured() {
        let cfg = cfg_with_roots(vec![], false);
        assert!(should_delete_original(&cfg, "/videos/alice", "a.flv"));
    }

    #[test]
    fn keep_original_suppresses_default_delete() {
        let cfg = cfg_with_roots(vec![], true);
        assert!(!should_delete_original(&cfg, "/videos/alice", "a.flv"));
    }

    #[test]
    fn per_root_rules_override_keep_original() {
        let root = RootConfig {
            path: "/videos".into(),
            filter: FilterConfig::default(),
            enable_delete: true,
            delete_mode: FilterMode::Whitelist,
            delete_rules: vec![FilterRule {
                rule_type: RuleType::Exact,
                pattern: "alice".to_owned(),
            }],
        };
        let cfg = cfg_with_roots(vec![root], true);
        assert!(should_delete_original(&cfg, "/videos/alice", "a.flv"));
        assert!(!should_delete_original(&cfg, "/videos/bob", "b.flv"));
    }

    #[test]
    fn another_roots_delete_flag_suppresses_unconfigured_roots_default() {
        let configured = RootConfig {
            path: "/videos/alice".into(),
            filter: FilterConfig::default(),
            enable_delete: true,
            delete_mode: FilterMode::Blacklist,
            delete_rules: vec![],
        };
        let unconfigured = RootConfig {
            path: "/videos/bob".into(),
            filter: FilterConfig::default(),
            enable_delete: false,
            delete_mode: FilterMode::Blacklist,
            delete_rules: vec![],
        };
        let cfg = cfg_with_roots(vec![configured, unconfigured], false);
        // bob's root doesn't opt in, and *some* root elsewhere does, so the
        // global "nothing configured anywhere" default no longer applies.
        assert!(!should_delete_original(&cfg, "/videos/bob", "b.flv"));
    }

    #[test]
    fn finalize_merges_extracts_and_completes_single_file_batch() {
        let store = db::open_test_store();
        let dir = tempdir().unwrap();
        let video_dir = dir.path().join("videos");
        std::fs::create_dir_all(&video_dir).unwrap();
        let src = video_dir.join("alice_20250101-000000.flv");
        std::fs::File::create(&src).unwrap().write_all(b"data").unwrap();

        let fp = crate::stability::fingerprint(&src).unwrap();
        store
            .upsert_observation(&video_dir.to_string_lossy(), "alice_20250101-000000.flv", &fp)
            .unwrap();
        store.mark_stable(&video_dir.to_string_lossy(), "alice_20250101-000000.flv").unwrap();
        let claimed = store.claim_stable_files().unwrap();

        let out_dir = dir.path().join("out");
        let tmp_dir = dir.path().join("tmp");
        std::fs::create_dir_all(&tmp_dir).unwrap();
        let files: Vec<NewBatchFile> = claimed
            .iter()
            .map(|f| NewBatchFile {
                dir_path: f.dir_path.clone(),
                filename: f.filename.clone(),
                fingerprint: f.fingerprint.clone(),
                pending_file_id: f.id,
            })
            .collect();
        let batch_id = store
            .create_batch_with_files("alice", &out_dir.to_string_lossy(), &tmp_dir.to_string_lossy(), &files)
            .unwrap();

        // Fake an already-encoded fragment: a "transcode" that's really a copy,
        // since the test has no real ffmpeg/libsvtav1 to invoke for this step.
        let encoded_path = tmp_dir.join("alice_20250101-000000.mp4");
        std::fs::copy(&src, &encoded_path).unwrap();
        store
            .mark_file_encoded(
                batch_id,
                &video_dir.to_string_lossy(),
                "alice_20250101-000000.flv",
                &encoded_path.to_string_lossy(),
            )
            .unwrap();

        // Use the fake-ffmpeg fixture for concat/extract so the test doesn't
        // depend on the real encoder binary being installed.
        let fake_ffmpeg = fake_ffmpeg_path();
        let finalizer = BatchFinalizer::new(&store, fake_ffmpeg);
        let cfg = cfg_with_roots(vec![], true);

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(finalizer.sweep(0, &cfg)).unwrap();

        let batch = store.get_batch(batch_id).unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert!(batch.final_mp4_path.is_some());
        assert!(batch.final_mp3_path.is_some());

        let pf = store
            .get_pending_file(&video_dir.to_string_lossy(), "alice_20250101-000000.flv")
            .unwrap()
            .unwrap();
        assert_eq!(pf.status, db::PendingFileStatus::Completed);
    }

    fn fake_ffmpeg_path() -> String {
        concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/fake-ffmpeg.sh").to_owned()
    }
}
