// This file is part of vodwatch, a stream-recording batch transcode
// and archival daemon.
// Copyright (C) 2026 The Vodwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Scheduler: single-flight periodic orchestrator tying scan, stability
//! tracking, batch assignment, encoding, and finalization into one cycle
//! (spec §4.7).

use crate::batcher::{earliest_time, Assignment, Batcher, Target};
use crate::config::AppConfig;
use crate::encoder::EncoderPool;
use crate::finalizer::BatchFinalizer;
use crate::scanner::Scanner;
use crate::stability::StabilityTracker;
use base::clock::Clocks;
use base::shutdown::Receiver as ShutdownReceiver;
use base::Error;
use db::{BatchFileStatus, BatchStatus, NewBatchFile, Store};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{info, warn};

/// Ties every pipeline stage together behind a single-flight guard so two
/// ticks (periodic or manually triggered) never run concurrently.
pub struct Scheduler<C: Clocks + Clone> {
    store: Arc<Store<C>>,
    config: RwLock<Arc<AppConfig>>,
    encoder: Arc<EncoderPool>,
    running: AtomicBool,
    trigger: Notify,
    current_file: Mutex<Option<String>>,
    current_phase: Mutex<Option<String>>,
}

impl<C: Clocks + Clone> Scheduler<C> {
    pub fn new(store: Arc<Store<C>>, config: AppConfig) -> Self {
        let encoder = Arc::new(EncoderPool::new(config.encoder.clone()));
        Scheduler {
            store,
            config: RwLock::new(Arc::new(config)),
            encoder,
            running: AtomicBool::new(false),
            trigger: Notify::new(),
            current_file: Mutex::new(None),
            current_phase: Mutex::new(None),
        }
    }

    pub fn config(&self) -> Arc<AppConfig> {
        self.config.read().unwrap().clone()
    }

    /// Hot-swaps the config atomically between cycles; picked up by the
    /// next tick (`PUT /api/config`, spec §6).
    pub fn set_config(&self, cfg: AppConfig) {
        *self.config.write().unwrap() = Arc::new(cfg);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn current_file(&self) -> Option<String> {
        self.current_file.lock().unwrap().clone()
    }

    pub fn current_phase(&self) -> Option<String> {
        self.current_phase.lock().unwrap().clone()
    }

    /// Wakes the tick loop immediately, for `POST /api/trigger`.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Cancels every in-flight encode, for the daemon's shutdown path
    /// (spec §5).
    pub fn cancel_encoders(&self) {
        self.encoder.cancel_all();
    }

    /// Startup crash recovery (spec §8): unwinds any claim or in-flight
    /// transition an unclean shutdown left behind.
    pub fn recover(&self) -> Result<(), Error> {
        let files = self.store.rollback_to_stable()?;
        let batch_files = self.store.rollback_encoding_files()?;
        let batches = self.store.rollback_batch_status()?;
        info!(files, batch_files, batches, "startup recovery complete");
        Ok(())
    }

    /// Runs the periodic tick loop until `shutdown` fires. A manual
    /// `trigger()` runs a cycle immediately instead of waiting out the rest
    /// of the interval. A shutdown observed while a cycle is in flight
    /// cancels every outstanding encode (spec §5) rather than waiting for
    /// the cycle to reach its own finish line.
    pub async fn run(&self, shutdown: ShutdownReceiver) {
        loop {
            let interval_secs = self.config().scheduler.scan_interval_seconds.max(1);
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(interval_secs)) => {}
                _ = self.trigger.notified() => {}
                _ = shutdown.as_future() => {}
            }
            if shutdown.check().is_err() {
                break;
            }
            tokio::select! {
                _ = self.run_cycle_guarded() => {}
                _ = async {
                    shutdown.as_future().await;
                    info!("shutdown requested mid-cycle; cancelling in-flight encodes");
                    self.cancel_encoders();
                    std::future::pending::<()>().await
                } => {}
            }
        }
    }

    async fn run_cycle_guarded(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("cycle already in flight; skipping tick");
            return;
        }
        if let Err(e) = self.run_cycle().await {
            warn!(error = %e.chain(), "cycle failed");
        }
        *self.current_phase.lock().unwrap() = None;
        *self.current_file.lock().unwrap() = None;
        self.running.store(false, Ordering::SeqCst);
    }

    fn set_phase(&self, phase: &str) {
        *self.current_phase.lock().unwrap() = Some(phase.to_owned());
    }

    async fn run_cycle(&self) -> Result<(), Error> {
        let cfg = self.config();

        self.set_phase("scanning");
        let scanner = Scanner::new(&cfg.scanner)?;
        let tracker = StabilityTracker::new(&self.store, cfg.scheduler.stability_threshold);
        for root in &cfg.scanner.video_roots {
            for (dir_path, filenames) in scanner.scan(root) {
                tracker.observe_all(&dir_path, &filenames);
            }
        }

        self.set_phase("promoting");
        tracker.promote_stable()?;

        self.set_phase("claiming");
        let claimed = self.store.claim_stable_files()?;

        self.set_phase("batching");
        if !claimed.is_empty() {
            let batcher = Batcher::new(cfg.scheduler.merge_window_hours);
            let existing = self.existing_batches_by_streamer()?;
            for assignment in batcher.assign(claimed, &existing) {
                self.apply_assignment(&cfg, assignment)?;
            }
        }
        // Files the batcher excluded (no parseable time/streamer) are still
        // `processing`; give them back to the stable pool for next cycle.
        self.store.rollback_to_stable()?;

        self.set_phase("encoding");
        self.encode_pending().await;

        self.set_phase("finalizing");
        let finalizer = BatchFinalizer::new(&self.store, cfg.encoder.ffmpeg_path.clone());
        finalizer.sweep(cfg.scheduler.quiescence_seconds, &cfg).await?;

        Ok(())
    }

    /// Gathers, per streamer, the single candidate `encoding` batch and the
    /// earliest parseable time among its current files — the shape the
    /// `Batcher` needs to decide new-batch vs. merge (spec §4.4).
    fn existing_batches_by_streamer(&self) -> Result<HashMap<String, (i64, jiff::Zoned)>, Error> {
        let mut out = HashMap::new();
        for batch in self.store.list_batches(Some(BatchStatus::Encoding))? {
            if out.contains_key(&batch.streamer) {
                continue;
            }
            let files = self.store.list_batch_files(batch.id)?;
            if let Some(earliest) = earliest_time(files.iter().map(|f| f.filename.as_str())) {
                out.insert(batch.streamer.clone(), (batch.id, earliest));
            }
        }
        Ok(out)
    }

    fn apply_assignment(&self, cfg: &AppConfig, assignment: Assignment) -> Result<(), Error> {
        let files: Vec<NewBatchFile> = assignment
            .files
            .iter()
            .map(|f| NewBatchFile {
                dir_path: f.dir_path.clone(),
                filename: f.filename.clone(),
                fingerprint: f.fingerprint.clone(),
                pending_file_id: f.id,
            })
            .collect();
        match assignment.target {
            Target::ExistingBatch(id) => self.store.add_files_to_batch(id, &files),
            Target::NewBatch => {
                let output_dir = Path::new(&cfg.output.output_root).join(&assignment.streamer);
                let tmp_dir = Path::new(&cfg.temp.temp_dir).join(&assignment.streamer);
                self.store
                    .create_batch_with_files(
                        &assignment.streamer,
                        &output_dir.to_string_lossy(),
                        &tmp_dir.to_string_lossy(),
                        &files,
                    )
                    .map(|_| ())
            }
        }
    }

    /// Submits every `pending` batch_file across every `encoding` batch to
    /// the encoder pool concurrently; the pool itself bounds actual
    /// concurrency to `max_parallel` (spec §5: submissions within a cycle
    /// have no mutual ordering).
    async fn encode_pending(&self) {
        let batches = match self.store.list_batches(Some(BatchStatus::Encoding)) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e.chain(), "listing encoding batches failed");
                return;
            }
        };
        let mut jobs = Vec::new();
        for batch in batches {
            match self.store.list_batch_files_with_status(batch.id, BatchFileStatus::Pending) {
                Ok(files) => jobs.extend(files.into_iter().map(|f| (batch.clone(), f))),
                Err(e) => warn!(batch_id = batch.id, error = %e.chain(), "listing pending batch_files failed"),
            }
        }

        let tasks = jobs.into_iter().map(|(batch, bf)| async move {
            *self.current_file.lock().unwrap() = Some(bf.filepath().to_string_lossy().into_owned());
            if let Err(e) = self.encoder.encode_file(&self.store, &batch, &bf).await {
                warn!(batch_file = bf.id, error = %e.chain(), "encode task failed");
            }
        });
        futures::future::join_all(tasks).await;
    }

    /// Advisory progress snapshot for `GET /api/status`, delegating to the
    /// encoder pool for an individual batch_file's ffmpeg progress line.
    pub fn encode_progress(&self, batch_file_id: i64) -> Option<crate::encoder::Progress> {
        self.encoder.progress_of(batch_file_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EncoderConfig, OutputConfig, SchedulerConfig, ScannerConfig, TempConfig};
    use std::io::Write;
    use tempfile::tempdir;

    fn test_config(video_root: &Path, output_root: &Path, temp_dir: &Path) -> AppConfig {
        AppConfig {
            scanner: ScannerConfig {
                video_roots: vec![crate::config::RootConfig {
                    path: video_root.to_owned(),
                    filter: crate::filter::FilterConfig::default(),
                    enable_delete: false,
                    delete_mode: crate::filter::FilterMode::Blacklist,
                    delete_rules: vec![],
                }],
                extensions: vec![".flv".to_owned()],
                allow_list: None,
                deny_list: None,
                simple_allow_list: None,
                simple_deny_list: None,
            },
            output: OutputConfig {
                output_root: output_root.to_owned(),
                keep_original: true,
            },
            scheduler: SchedulerConfig {
                scan_interval_seconds: 30,
                merge_window_hours: 1.0,
                stability_threshold: 1,
                quiescence_seconds: 0,
            },
            temp: TempConfig {
                temp_dir: temp_dir.to_owned(),
                size_limit_mb: None,
            },
            encoder: EncoderConfig {
                max_parallel: 1,
                max_retries: 1,
                crf: 30,
                preset: 6,
                ffmpeg_path: concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/fake-ffmpeg.sh").to_owned(),
                shutdown_grace_seconds: 1,
            },
        }
    }

    #[test]
    fn recover_clears_crash_state() {
        let store = Arc::new(db::open_test_store());
        store.upsert_observation("/v", "a.flv", &"a".repeat(32)).unwrap();
        store.mark_stable("/v", "a.flv").unwrap();
        store.claim_stable_files().unwrap();

        let dir = tempdir().unwrap();
        let cfg = test_config(dir.path(), dir.path(), dir.path());
        let scheduler = Scheduler::new(store.clone(), cfg);
        scheduler.recover().unwrap();

        let f = store.get_pending_file("/v", "a.flv").unwrap().unwrap();
        assert_eq!(f.status, db::PendingFileStatus::Stable);
    }

    #[test]
    fn full_cycle_runs_one_file_through_to_completion() {
        let store = Arc::new(db::open_test_store());
        let dir = tempdir().unwrap();
        let video_dir = dir.path().join("videos");
        std::fs::create_dir_all(&video_dir).unwrap();
        std::fs::File::create(video_dir.join("alice_20250101-000000.flv"))
            .unwrap()
            .write_all(b"data")
            .unwrap();

        let cfg = test_config(&video_dir, &dir.path().join("out"), &dir.path().join("tmp"));
        let scheduler = Scheduler::new(store.clone(), cfg);

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            scheduler.run_cycle().await.unwrap();
            // one scan to go pending->stable threshold 1 already stable after
            // one observation; run a second cycle so claim/batch/encode/finalize happen.
            scheduler.run_cycle().await.unwrap();
        });

        let f = store.get_pending_file(&video_dir.to_string_lossy(), "alice_20250101-000000.flv").unwrap().unwrap();
        assert_eq!(f.status, db::PendingFileStatus::Completed);
    }
}
