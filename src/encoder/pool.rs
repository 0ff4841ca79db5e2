// This file is part of vodwatch, a stream-recording batch transcode
// and archival daemon.
// Copyright (C) 2026 The Vodwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Bounded-concurrency execution of external encode jobs (spec §4.5).

use crate::config::EncoderConfig;
use crate::encoder::progress::{parse_line, Progress};
use crate::stability::fingerprint;
use base::clock::Clocks;
use base::Error;
use db::{Batch, BatchFile, PendingFileStatus, Store};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Notify, Semaphore};
use tracing::warn;

#[derive(Debug)]
pub enum EncodeOutcome {
    Skipped,
    Encoded(PathBuf),
    Failed,
    Cancelled,
}

struct Task {
    cancel: Arc<Notify>,
}

/// Bounds in-flight encoder child processes to `max_parallel` and tracks
/// per-file progress for the control plane to read.
pub struct EncoderPool {
    semaphore: Arc<Semaphore>,
    cfg: EncoderConfig,
    progress: Mutex<HashMap<i64, Progress>>,
    tasks: Mutex<HashMap<i64, Task>>,
}

impl EncoderPool {
    pub fn new(cfg: EncoderConfig) -> Self {
        EncoderPool {
            semaphore: Arc::new(Semaphore::new(cfg.max_parallel.max(1))),
            cfg,
            progress: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn progress_of(&self, batch_file_id: i64) -> Option<Progress> {
        self.progress.lock().unwrap().get(&batch_file_id).cloned()
    }

    /// Requests cancellation of an in-flight encode. A no-op if the task
    /// isn't currently running: the row stays `encoding` and will be rolled
    /// back by startup recovery.
    pub fn cancel(&self, batch_file_id: i64) {
        if let Some(task) = self.tasks.lock().unwrap().get(&batch_file_id) {
            task.cancel.notify_one();
        }
    }

    /// Requests cancellation of every currently in-flight encode, for the
    /// daemon's shutdown path (spec §5: "cancels all outstanding encoder
    /// tasks on shutdown").
    pub fn cancel_all(&self) {
        for task in self.tasks.lock().unwrap().values() {
            task.cancel.notify_one();
        }
    }

    /// Runs the per-file encode contract (spec §4.5 steps 1-7): idempotence
    /// pre-check, `encoding` transition, child process spawn with
    /// line-buffered progress parsing, and success/retry/give-up handling.
    pub async fn encode_file<C: Clocks + Clone>(
        &self,
        store: &Store<C>,
        batch: &Batch,
        batch_file: &BatchFile,
    ) -> Result<EncodeOutcome, Error> {
        let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore not closed");
        let result = self.encode_file_inner(store, batch, batch_file).await;
        drop(permit);
        result
    }

    async fn encode_file_inner<C: Clocks + Clone>(
        &self,
        store: &Store<C>,
        batch: &Batch,
        batch_file: &BatchFile,
    ) -> Result<EncodeOutcome, Error> {
        let input_path = batch_file.filepath();

        if let Ok(fp) = fingerprint(&input_path) {
            if fp == batch_file.fingerprint {
                if let Some(pf_id) = batch_file.pending_file_id {
                    if let Some(pf) = store.get_pending_file_by_id(pf_id)? {
                        if pf.status == PendingFileStatus::Completed {
                            return Ok(EncodeOutcome::Skipped);
                        }
                    }
                }
            }
        }

        store.mark_batchfile_encoding(batch.id, &batch_file.dir_path, &batch_file.filename)?;

        let output_path = self.output_path(batch, &input_path);
        let cancel = Arc::new(Notify::new());
        self.tasks.lock().unwrap().insert(
            batch_file.id,
            Task { cancel: cancel.clone() },
        );
        let run_result = self
            .run_encode(&input_path, &output_path, batch_file.id, cancel)
            .await;
        self.tasks.lock().unwrap().remove(&batch_file.id);
        self.progress.lock().unwrap().remove(&batch_file.id);

        match run_result {
            RunOutcome::Success => {
                store.mark_file_encoded(
                    batch.id,
                    &batch_file.dir_path,
                    &batch_file.filename,
                    &output_path.to_string_lossy(),
                )?;
                Ok(EncodeOutcome::Encoded(output_path))
            }
            RunOutcome::Cancelled => {
                let _ = std::fs::remove_file(&output_path);
                Ok(EncodeOutcome::Cancelled)
            }
            RunOutcome::Failed => {
                let _ = std::fs::remove_file(&output_path);
                if (batch_file.retry_count as u32) < self.cfg.max_retries {
                    store.increment_batchfile_retry(
                        batch.id,
                        &batch_file.dir_path,
                        &batch_file.filename,
                    )?;
                    warn!(
                        batch_file = batch_file.id,
                        retry = batch_file.retry_count + 1,
                        "encode failed; retrying"
                    );
                    Ok(EncodeOutcome::Failed)
                } else {
                    store.delete_batchfile_and_incr_failed(
                        batch.id,
                        &batch_file.dir_path,
                        &batch_file.filename,
                    )?;
                    if let Some(pf_id) = batch_file.pending_file_id {
                        if let Some(pf) = store.get_pending_file_by_id(pf_id)? {
                            store.mark_deprecated(&pf.dir_path, &pf.filename)?;
                        }
                    }
                    warn!(batch_file = batch_file.id, "encode exhausted retries; giving up");
                    Ok(EncodeOutcome::Failed)
                }
            }
        }
    }

    /// Output path preserves the input's parent directory name, landing
    /// under the batch's `tmp_dir` with a `.mp4` extension.
    fn output_path(&self, batch: &Batch, input_path: &Path) -> PathBuf {
        let parent_name = input_path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or("unknown");
        let stem = input_path.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
        Path::new(&batch.tmp_dir).join(parent_name).join(format!("{stem}.mp4"))
    }

    async fn run_encode(
        &self,
        input: &Path,
        output: &Path,
        batch_file_id: i64,
        cancel: Arc<Notify>,
    ) -> RunOutcome {
        if let Some(parent) = output.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(error = %e, "unable to create encoder output directory");
                return RunOutcome::Failed;
            }
        }

        let mut cmd = Command::new(&self.cfg.ffmpeg_path);
        cmd.arg("-y")
            .arg("-i")
            .arg(input)
            .args(["-c:v", "libsvtav1", "-crf", &self.cfg.crf.to_string()])
            .args(["-preset", &self.cfg.preset.to_string()])
            .args(["-c:a", "aac", "-b:a", "128k"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to spawn encoder process");
                return RunOutcome::Failed;
            }
        };
        let stderr = child.stderr.take().expect("stderr piped");
        let mut lines = BufReader::new(stderr).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(p) = parse_line(&line) {
                                self.progress.lock().unwrap().insert(batch_file_id, p);
                            }
                        }
                        Ok(None) => break,
                        Err(_) => break,
                    }
                }
                _ = cancel.notified() => {
                    if let Some(pid) = child.id() {
                        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                    }
                    let grace = std::time::Duration::from_secs(self.cfg.shutdown_grace_seconds);
                    if tokio::time::timeout(grace, child.wait()).await.is_err() {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    }
                    return RunOutcome::Cancelled;
                }
            }
        }

        match child.wait().await {
            Ok(status) if status.success() && output.exists() => RunOutcome::Success,
            Ok(_) => RunOutcome::Failed,
            Err(e) => {
                warn!(error = %e, "encoder process wait failed");
                RunOutcome::Failed
            }
        }
    }
}

enum RunOutcome {
    Success,
    Failed,
    Cancelled,
}

/// Invokes the encoder to concatenate already-encoded fragments (spec §4.6
/// step 3) or extract audio (step 4). These are simpler, single-shot
/// invocations with no progress tracking or retry — the finalizer handles
/// its own error path.
pub async fn run_concat(ffmpeg_path: &str, manifest: &Path, output: &Path) -> Result<(), Error> {
    run_simple(
        ffmpeg_path,
        &[
            "-y",
            "-f",
            "concat",
            "-safe",
            "0",
            "-i",
            &manifest.to_string_lossy(),
            "-c",
            "copy",
            &output.to_string_lossy(),
        ],
    )
    .await
}

pub async fn run_extract_mp3(ffmpeg_path: &str, input: &Path, output: &Path) -> Result<(), Error> {
    run_simple(
        ffmpeg_path,
        &[
            "-y",
            "-i",
            &input.to_string_lossy(),
            "-vn",
            "-c:a",
            "libmp3lame",
            "-q:a",
            "2",
            &output.to_string_lossy(),
        ],
    )
    .await
}

async fn run_simple(ffmpeg_path: &str, args: &[&str]) -> Result<(), Error> {
    let status = Command::new(ffmpeg_path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| base::format_err_t!(Internal, format!("spawning encoder: {}", e)))?;
    if !status.success() {
        base::bail_t!(Internal, "encoder exited with {}", status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_path_preserves_parent_directory_name() {
        let pool = EncoderPool::new(EncoderConfig {
            max_parallel: 1,
            max_retries: 2,
            crf: 30,
            preset: 6,
            ffmpeg_path: "ffmpeg".to_owned(),
            shutdown_grace_seconds: 10,
        });
        let batch = Batch {
            id: 1,
            streamer: "alice".to_owned(),
            status: db::BatchStatus::Encoding,
            output_dir: "/out".to_owned(),
            tmp_dir: "/tmp/vodwatch/1".to_owned(),
            final_mp4_path: None,
            final_mp3_path: None,
            total_files: 1,
            encoded_count: 0,
            failed_count: 0,
            updated_at: "2025-01-01T00:00:00Z".to_owned(),
        };
        let input = Path::new("/videos/alice/clip.flv");
        let out = pool.output_path(&batch, input);
        assert_eq!(out, PathBuf::from("/tmp/vodwatch/1/alice/clip.mp4"));
    }
}
