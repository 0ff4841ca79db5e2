// This file is part of vodwatch, a stream-recording batch transcode
// and archival daemon.
// Copyright (C) 2026 The Vodwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The `Store`: a `rusqlite` connection guarded by a mutex, plus every
//! mutation the pipeline (scanner, stability tracker, batcher, encoder pool,
//! finalizer, scheduler) needs to perform atomically.
//!
//! Every operation that touches more than one row opens a transaction,
//! performs its `prepare_cached` + `execute`/`query_row` calls, and commits
//! before returning — so a crash mid-operation never leaves the three
//! tables in a state the state machine didn't intend. See DESIGN.md for how
//! this mirrors the teacher's `db.rs`.

use crate::model::{
    Batch, BatchFile, BatchFileStatus, BatchStatus, NewBatchFile, ObservationOutcome,
    PendingFile, PendingFileStatus,
};
use crate::{SCHEMA, SCHEMA_VERSION};
use base::clock::Clocks;
use base::{bail_t, format_err_t, Error, ErrorKind, ResultExt};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// Thread-safe handle to the on-disk (or in-memory) database.
///
/// `C` defaults to [`base::clock::RealClocks`]; tests substitute
/// [`base::clock::SimulatedClocks`] so `updated_at` columns are deterministic.
pub struct Store<C: Clocks + Clone = base::clock::RealClocks> {
    conn: Mutex<Connection>,
    clocks: C,
}

fn row_to_pending_file(row: &rusqlite::Row) -> rusqlite::Result<PendingFile> {
    Ok(PendingFile {
        id: row.get("id")?,
        dir_path: row.get("dir_path")?,
        filename: row.get("filename")?,
        fingerprint: row.get("fingerprint")?,
        stable_count: row.get("stable_count")?,
        status: row.get("status")?,
        temp_mp4_path: row.get("temp_mp4_path")?,
        temp_mp3_path: row.get("temp_mp3_path")?,
        start_time: row.get("start_time")?,
        end_time: row.get("end_time")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_batch(row: &rusqlite::Row) -> rusqlite::Result<Batch> {
    Ok(Batch {
        id: row.get("id")?,
        streamer: row.get("streamer")?,
        status: row.get("status")?,
        output_dir: row.get("output_dir")?,
        tmp_dir: row.get("tmp_dir")?,
        final_mp4_path: row.get("final_mp4_path")?,
        final_mp3_path: row.get("final_mp3_path")?,
        total_files: row.get("total_files")?,
        encoded_count: row.get("encoded_count")?,
        failed_count: row.get("failed_count")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_batch_file(row: &rusqlite::Row) -> rusqlite::Result<BatchFile> {
    Ok(BatchFile {
        id: row.get("id")?,
        batch_id: row.get("batch_id")?,
        dir_path: row.get("dir_path")?,
        filename: row.get("filename")?,
        fingerprint: row.get("fingerprint")?,
        pending_file_id: row.get("pending_file_id")?,
        status: row.get("status")?,
        encoded_path: row.get("encoded_path")?,
        retry_count: row.get("retry_count")?,
        updated_at: row.get("updated_at")?,
    })
}

/// True iff `e` is a `SQLITE_BUSY`/`SQLITE_LOCKED` failure, meaning some
/// other connection is mid-write. Callers that can simply retry next tick
/// (notably `claim_stable_files`) treat this as "nothing to do" rather than
/// propagating an error.
fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if matches!(
                f.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

impl<C: Clocks + Clone> Store<C> {
    /// Opens (creating if absent) the database at `path`.
    pub fn open(path: &Path, clocks: C) -> Result<Self, Error> {
        let mut conn = Connection::open(path).err_kind(ErrorKind::Unavailable)?;
        Self::init(&mut conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
            clocks,
        })
    }

    /// Opens a private in-memory database, for tests.
    pub fn open_in_memory(clocks: C) -> Result<Self, Error> {
        let mut conn = Connection::open_in_memory().err_kind(ErrorKind::Internal)?;
        Self::init(&mut conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
            clocks,
        })
    }

    fn init(conn: &mut Connection) -> Result<(), Error> {
        conn.pragma_update(None, "foreign_keys", true)
            .err_kind(ErrorKind::Internal)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .err_kind(ErrorKind::Internal)?;
        let has_meta: bool = conn
            .query_row(
                "select count(*) > 0 from sqlite_master where type = 'table' and name = 'meta'",
                [],
                |row| row.get(0),
            )
            .err_kind(ErrorKind::Internal)?;
        if has_meta {
            debug!("opening existing database");
            return Ok(());
        }
        debug!("initializing new database");
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .err_kind(ErrorKind::Internal)?;
        tx.execute_batch(SCHEMA).err_kind(ErrorKind::Internal)?;
        tx.execute(
            "insert into meta (id, schema_version) values (0, ?1)",
            params![SCHEMA_VERSION],
        )
        .err_kind(ErrorKind::Internal)?;
        tx.commit().err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    /// Returns the schema version of an already-open database, for `vodwatch
    /// check`.
    pub fn schema_version(&self) -> Result<i64, Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("select schema_version from meta where id = 0", [], |r| {
            r.get(0)
        })
        .err_kind(ErrorKind::Internal)
    }

    fn now(&self) -> String {
        self.clocks.now().to_string()
    }

    // ---- pending_files -----------------------------------------------

    /// Records a stability observation for `dir_path`/`filename` with the
    /// given `fingerprint`. See spec §4.3 for the four possible outcomes.
    pub fn upsert_observation(
        &self,
        dir_path: &str,
        filename: &str,
        fingerprint: &str,
    ) -> Result<ObservationOutcome, Error> {
        if !base::strutil::is_hex(fingerprint, 32) {
            bail_t!(InvalidArgument, "fingerprint {:?} is not 32 hex chars", fingerprint);
        }
        let now = self.now();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().err_kind(ErrorKind::Internal)?;
        let existing: Option<(i64, String, PendingFileStatus)> = tx
            .query_row(
                "select id, fingerprint, status from pending_files \
                 where dir_path = ?1 and filename = ?2",
                params![dir_path, filename],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .err_kind(ErrorKind::Internal)?;
        let outcome = match existing {
            None => {
                tx.execute(
                    "insert into pending_files \
                     (dir_path, filename, fingerprint, stable_count, status, updated_at) \
                     values (?1, ?2, ?3, 1, 'pending', ?4)",
                    params![dir_path, filename, fingerprint, now],
                )
                .err_kind(ErrorKind::Internal)?;
                ObservationOutcome::Created
            }
            Some((id, old_fingerprint, status)) if old_fingerprint != fingerprint => {
                tx.execute(
                    "update pending_files set fingerprint = ?1, stable_count = 1, \
                     status = 'pending', updated_at = ?2 where id = ?3",
                    params![fingerprint, now, id],
                )
                .err_kind(ErrorKind::Internal)?;
                let _ = status;
                ObservationOutcome::FingerprintReset
            }
            Some((id, _, PendingFileStatus::Pending)) => {
                tx.execute(
                    "update pending_files set stable_count = stable_count + 1, \
                     updated_at = ?1 where id = ?2",
                    params![now, id],
                )
                .err_kind(ErrorKind::Internal)?;
                ObservationOutcome::Incremented
            }
            Some(_) => ObservationOutcome::Ignored,
        };
        tx.commit().err_kind(ErrorKind::Internal)?;
        Ok(outcome)
    }

    /// Returns all `pending` rows whose `stable_count >= min_count`,
    /// ordered by id, for the stability tracker to promote.
    pub fn find_stable_with_min_count(&self, min_count: i64) -> Result<Vec<PendingFile>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare_cached(
                "select * from pending_files where status = 'pending' and stable_count >= ?1 \
                 order by id",
            )
            .err_kind(ErrorKind::Internal)?;
        let rows = stmt
            .query_map(params![min_count], row_to_pending_file)
            .err_kind(ErrorKind::Internal)?;
        rows.collect::<Result<Vec<_>, _>>()
            .err_kind(ErrorKind::Internal)
    }

    pub fn mark_stable(&self, dir_path: &str, filename: &str) -> Result<(), Error> {
        self.set_pending_file_status(dir_path, filename, PendingFileStatus::Pending, PendingFileStatus::Stable)
    }

    pub fn mark_deprecated(&self, dir_path: &str, filename: &str) -> Result<(), Error> {
        let now = self.now();
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute(
                "update pending_files set status = 'deprecated', updated_at = ?1 \
                 where dir_path = ?2 and filename = ?3",
                params![now, dir_path, filename],
            )
            .err_kind(ErrorKind::Internal)?;
        if n == 0 {
            bail_t!(NotFound, "no pending_files row for {}/{}", dir_path, filename);
        }
        Ok(())
    }

    /// Marks a file `completed`, recording the batch's start/end time once
    /// the owning batch finishes (spec §4.6, step `finalize`).
    pub fn mark_completed(
        &self,
        dir_path: &str,
        filename: &str,
        start_time: &str,
        end_time: &str,
    ) -> Result<(), Error> {
        let now = self.now();
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute(
                "update pending_files set status = 'completed', start_time = ?1, \
                 end_time = ?2, updated_at = ?3 where dir_path = ?4 and filename = ?5",
                params![start_time, end_time, now, dir_path, filename],
            )
            .err_kind(ErrorKind::Internal)?;
        if n == 0 {
            bail_t!(NotFound, "no pending_files row for {}/{}", dir_path, filename);
        }
        Ok(())
    }

    fn set_pending_file_status(
        &self,
        dir_path: &str,
        filename: &str,
        from: PendingFileStatus,
        to: PendingFileStatus,
    ) -> Result<(), Error> {
        let now = self.now();
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute(
                "update pending_files set status = ?1, updated_at = ?2 \
                 where dir_path = ?3 and filename = ?4 and status = ?5",
                params![to, now, dir_path, filename, from],
            )
            .err_kind(ErrorKind::Internal)?;
        if n == 0 {
            bail_t!(
                FailedPrecondition,
                "no {}/{} pending_files row in status {}",
                dir_path,
                filename,
                from
            );
        }
        Ok(())
    }

    /// Atomically claims every `stable` file for encoding, flipping each to
    /// `processing` in the same transaction that reads them. Uses an
    /// `IMMEDIATE` transaction so two schedulers racing never double-claim;
    /// if the database is already locked by another writer this returns an
    /// empty vec rather than erroring, since the caller (the scheduler) just
    /// tries again next tick.
    pub fn claim_stable_files(&self) -> Result<Vec<PendingFile>, Error> {
        let now = self.now();
        let mut conn = self.conn.lock().unwrap();
        let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
            Ok(tx) => tx,
            Err(e) if is_busy(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e).err_kind(ErrorKind::Internal),
        };
        let files: Vec<PendingFile> = {
            let mut stmt = tx
                .prepare_cached("select * from pending_files where status = 'stable' order by id")
                .err_kind(ErrorKind::Internal)?;
            let rows = stmt
                .query_map([], row_to_pending_file)
                .err_kind(ErrorKind::Internal)?;
            rows.collect::<Result<Vec<_>, _>>()
                .err_kind(ErrorKind::Internal)?
        };
        {
            let mut stmt = tx
                .prepare_cached(
                    "update pending_files set status = 'processing', updated_at = ?1 where id = ?2",
                )
                .err_kind(ErrorKind::Internal)?;
            for f in &files {
                stmt.execute(params![now, f.id]).err_kind(ErrorKind::Internal)?;
            }
        }
        tx.commit().err_kind(ErrorKind::Internal)?;
        Ok(files)
    }

    /// Rolls back every `processing` file to `stable`, for crash recovery
    /// (spec §8: a claim that never became a batch on restart).
    pub fn rollback_to_stable(&self) -> Result<usize, Error> {
        let now = self.now();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "update pending_files set status = 'stable', updated_at = ?1 where status = 'processing'",
            params![now],
        )
        .err_kind(ErrorKind::Internal)
    }

    pub fn get_pending_file(&self, dir_path: &str, filename: &str) -> Result<Option<PendingFile>, Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "select * from pending_files where dir_path = ?1 and filename = ?2",
            params![dir_path, filename],
            row_to_pending_file,
        )
        .optional()
        .err_kind(ErrorKind::Internal)
    }

    pub fn get_pending_file_by_id(&self, id: i64) -> Result<Option<PendingFile>, Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "select * from pending_files where id = ?1",
            params![id],
            row_to_pending_file,
        )
        .optional()
        .err_kind(ErrorKind::Internal)
    }

    pub fn list_pending_files(
        &self,
        status: Option<PendingFileStatus>,
    ) -> Result<Vec<PendingFile>, Error> {
        let conn = self.conn.lock().unwrap();
        match status {
            Some(status) => {
                let mut stmt = conn
                    .prepare_cached("select * from pending_files where status = ?1 order by id")
                    .err_kind(ErrorKind::Internal)?;
                let rows = stmt
                    .query_map(params![status], row_to_pending_file)
                    .err_kind(ErrorKind::Internal)?;
                rows.collect::<Result<Vec<_>, _>>().err_kind(ErrorKind::Internal)
            }
            None => {
                let mut stmt = conn
                    .prepare_cached("select * from pending_files order by id")
                    .err_kind(ErrorKind::Internal)?;
                let rows = stmt.query_map([], row_to_pending_file).err_kind(ErrorKind::Internal)?;
                rows.collect::<Result<Vec<_>, _>>().err_kind(ErrorKind::Internal)
            }
        }
    }

    /// Removes a pending_files row outright, used by the admin "delete file"
    /// endpoint (spec §7, `DELETE /api/files/:id`).
    pub fn delete_pending_file(&self, id: i64) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute("delete from pending_files where id = ?1", params![id])
            .err_kind(ErrorKind::Internal)?;
        if n == 0 {
            bail_t!(NotFound, "no pending_files row with id {}", id);
        }
        Ok(())
    }

    // ---- task_batches / task_batch_files ----------------------------------------

    /// Creates a new batch in `encoding` status with the given files, and
    /// marks the source `pending_files` rows `staged`. Returns the new
    /// batch's id.
    pub fn create_batch_with_files(
        &self,
        streamer: &str,
        output_dir: &str,
        tmp_dir: &str,
        files: &[NewBatchFile],
    ) -> Result<i64, Error> {
        if files.is_empty() {
            bail_t!(InvalidArgument, "cannot create a batch with no files");
        }
        let now = self.now();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().err_kind(ErrorKind::Internal)?;
        tx.execute(
            "insert into task_batches \
             (streamer, status, output_dir, tmp_dir, total_files, updated_at) \
             values (?1, 'encoding', ?2, ?3, ?4, ?5)",
            params![streamer, output_dir, tmp_dir, files.len() as i64, now],
        )
        .err_kind(ErrorKind::Internal)?;
        let batch_id = tx.last_insert_rowid();
        Self::insert_batch_files(&tx, batch_id, files, &now)?;
        tx.commit().err_kind(ErrorKind::Internal)?;
        Ok(batch_id)
    }

    /// Adds more files to an existing `encoding` batch (spec §4.4's
    /// merge-into-existing-batch path), bumping `total_files` and staging
    /// the source pending_files rows.
    pub fn add_files_to_batch(&self, batch_id: i64, files: &[NewBatchFile]) -> Result<(), Error> {
        if files.is_empty() {
            return Ok(());
        }
        let now = self.now();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().err_kind(ErrorKind::Internal)?;
        let n = tx
            .execute(
                "update task_batches set total_files = total_files + ?1, updated_at = ?2 \
                 where id = ?3 and status = 'encoding'",
                params![files.len() as i64, now, batch_id],
            )
            .err_kind(ErrorKind::Internal)?;
        if n == 0 {
            bail_t!(FailedPrecondition, "batch {} is not in encoding status", batch_id);
        }
        Self::insert_batch_files(&tx, batch_id, files, &now)?;
        tx.commit().err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    fn insert_batch_files(
        tx: &rusqlite::Transaction,
        batch_id: i64,
        files: &[NewBatchFile],
        now: &str,
    ) -> Result<(), Error> {
        let mut insert_bf = tx
            .prepare_cached(
                "insert into task_batch_files \
                 (batch_id, dir_path, filename, fingerprint, pending_file_id, status, updated_at) \
                 values (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
            )
            .err_kind(ErrorKind::Internal)?;
        let mut stage_pf = tx
            .prepare_cached(
                "update pending_files set status = 'staged', updated_at = ?1 where id = ?2 and status = 'processing'",
            )
            .err_kind(ErrorKind::Internal)?;
        for f in files {
            insert_bf
                .execute(params![
                    batch_id,
                    f.dir_path,
                    f.filename,
                    f.fingerprint,
                    f.pending_file_id,
                    now,
                ])
                .err_kind(ErrorKind::Internal)?;
            let n = stage_pf
                .execute(params![now, f.pending_file_id])
                .err_kind(ErrorKind::Internal)?;
            if n == 0 {
                bail_t!(
                    FailedPrecondition,
                    "pending_file {} was not in processing status",
                    f.pending_file_id
                );
            }
        }
        Ok(())
    }

    /// Marks a single task_batch_files row `encoding`, for the encoder pool to
    /// claim a slot before spawning ffmpeg.
    pub fn mark_batchfile_encoding(&self, batch_id: i64, dir_path: &str, filename: &str) -> Result<(), Error> {
        let now = self.now();
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute(
                "update task_batch_files set status = 'encoding', updated_at = ?1 \
                 where batch_id = ?2 and dir_path = ?3 and filename = ?4 and status = 'pending'",
                params![now, batch_id, dir_path, filename],
            )
            .err_kind(ErrorKind::Internal)?;
        if n == 0 {
            bail_t!(
                FailedPrecondition,
                "batch_file {}/{} in batch {} was not pending",
                dir_path,
                filename,
                batch_id
            );
        }
        Ok(())
    }

    /// Marks a task_batch_files row `encoded` with its output path, and bumps the
    /// owning batch's `encoded_count`.
    pub fn mark_file_encoded(
        &self,
        batch_id: i64,
        dir_path: &str,
        filename: &str,
        encoded_path: &str,
    ) -> Result<(), Error> {
        let now = self.now();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().err_kind(ErrorKind::Internal)?;
        let n = tx
            .execute(
                "update task_batch_files set status = 'encoded', encoded_path = ?1, updated_at = ?2 \
                 where batch_id = ?3 and dir_path = ?4 and filename = ?5",
                params![encoded_path, now, batch_id, dir_path, filename],
            )
            .err_kind(ErrorKind::Internal)?;
        if n == 0 {
            bail_t!(NotFound, "no batch_file {}/{} in batch {}", dir_path, filename, batch_id);
        }
        tx.execute(
            "update task_batches set encoded_count = encoded_count + 1, updated_at = ?1 where id = ?2",
            params![now, batch_id],
        )
        .err_kind(ErrorKind::Internal)?;
        tx.commit().err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    /// Removes a task_batch_files row outright and bumps `failed_count`, used
    /// once the encoder pool has exhausted its retries for that file (spec
    /// §4.5's permanent-failure path). The row is deleted rather than
    /// flipped to a `failed` status: per spec §9's Open Question, this keeps
    /// `total_files` the batch's high-watermark and `failed_count` its
    /// attrition counter, rather than double-bookkeeping the same fact in
    /// both a row and a counter.
    pub fn delete_batchfile_and_incr_failed(
        &self,
        batch_id: i64,
        dir_path: &str,
        filename: &str,
    ) -> Result<(), Error> {
        let now = self.now();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().err_kind(ErrorKind::Internal)?;
        let n = tx
            .execute(
                "delete from task_batch_files where batch_id = ?1 and dir_path = ?2 and filename = ?3",
                params![batch_id, dir_path, filename],
            )
            .err_kind(ErrorKind::Internal)?;
        if n == 0 {
            bail_t!(NotFound, "no batch_file {}/{} in batch {}", dir_path, filename, batch_id);
        }
        tx.execute(
            "update task_batches set failed_count = failed_count + 1, updated_at = ?1 where id = ?2",
            params![now, batch_id],
        )
        .err_kind(ErrorKind::Internal)?;
        tx.commit().err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    /// Increments a batch_file's retry_count and flips it back to `pending`
    /// so the encoder pool will pick it up again; returns the new count so
    /// the caller can compare against the configured retry limit.
    pub fn increment_batchfile_retry(
        &self,
        batch_id: i64,
        dir_path: &str,
        filename: &str,
    ) -> Result<i64, Error> {
        let now = self.now();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "update task_batch_files set retry_count = retry_count + 1, status = 'pending', \
             updated_at = ?1 where batch_id = ?2 and dir_path = ?3 and filename = ?4",
            params![now, batch_id, dir_path, filename],
        )
        .err_kind(ErrorKind::Internal)?;
        conn.query_row(
            "select retry_count from task_batch_files where batch_id = ?1 and dir_path = ?2 and filename = ?3",
            params![batch_id, dir_path, filename],
            |row| row.get(0),
        )
        .err_kind(ErrorKind::Internal)
    }

    pub fn list_batch_files(&self, batch_id: i64) -> Result<Vec<BatchFile>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare_cached("select * from task_batch_files where batch_id = ?1 order by id")
            .err_kind(ErrorKind::Internal)?;
        let rows = stmt
            .query_map(params![batch_id], row_to_batch_file)
            .err_kind(ErrorKind::Internal)?;
        rows.collect::<Result<Vec<_>, _>>().err_kind(ErrorKind::Internal)
    }

    pub fn list_batch_files_with_status(
        &self,
        batch_id: i64,
        status: BatchFileStatus,
    ) -> Result<Vec<BatchFile>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare_cached(
                "select * from task_batch_files where batch_id = ?1 and status = ?2 order by id",
            )
            .err_kind(ErrorKind::Internal)?;
        let rows = stmt
            .query_map(params![batch_id, status], row_to_batch_file)
            .err_kind(ErrorKind::Internal)?;
        rows.collect::<Result<Vec<_>, _>>().err_kind(ErrorKind::Internal)
    }

    pub fn get_batch(&self, batch_id: i64) -> Result<Option<Batch>, Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "select * from task_batches where id = ?1",
            params![batch_id],
            row_to_batch,
        )
        .optional()
        .err_kind(ErrorKind::Internal)
    }

    pub fn list_batches(&self, status: Option<BatchStatus>) -> Result<Vec<Batch>, Error> {
        let conn = self.conn.lock().unwrap();
        match status {
            Some(status) => {
                let mut stmt = conn
                    .prepare_cached("select * from task_batches where status = ?1 order by id")
                    .err_kind(ErrorKind::Internal)?;
                let rows = stmt
                    .query_map(params![status], row_to_batch)
                    .err_kind(ErrorKind::Internal)?;
                rows.collect::<Result<Vec<_>, _>>().err_kind(ErrorKind::Internal)
            }
            None => {
                let mut stmt = conn
                    .prepare_cached("select * from task_batches order by id")
                    .err_kind(ErrorKind::Internal)?;
                let rows = stmt.query_map([], row_to_batch).err_kind(ErrorKind::Internal)?;
                rows.collect::<Result<Vec<_>, _>>().err_kind(ErrorKind::Internal)
            }
        }
    }

    /// Returns the ids of every `encoding` batch whose files have all
    /// reached a terminal encoder state (`encoded_count + failed_count ==
    /// total_files` and no `task_batch_files` row left `pending`/`encoding`) and
    /// which has been quiescent — no `task_batch_files` mutation — for at least
    /// `min_age_seconds`. A batch where every file permanently failed is
    /// still a candidate here; quiescence is the sole guard against racing
    /// an in-flight encode (spec §5).
    pub fn find_complete_batch_ids(&self, min_age_seconds: i64) -> Result<Vec<i64>, Error> {
        let now = self.clocks.now();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare_cached(
                "select b.id, \
                    (select max(bf.updated_at) from task_batch_files bf where bf.batch_id = b.id), \
                    b.updated_at \
                 from task_batches b \
                 where b.status = 'encoding' \
                   and b.encoded_count + b.failed_count = b.total_files \
                   and not exists ( \
                     select 1 from task_batch_files bf2 \
                     where bf2.batch_id = b.id and bf2.status in ('pending', 'encoding') \
                   ) \
                 order by b.id",
            )
            .err_kind(ErrorKind::Internal)?;
        let candidates: Vec<(i64, Option<String>, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .err_kind(ErrorKind::Internal)?
            .collect::<Result<Vec<_>, _>>()
            .err_kind(ErrorKind::Internal)?;
        let mut ids = Vec::new();
        for (id, last_file_update, batch_updated_at) in candidates {
            let last = last_file_update.unwrap_or(batch_updated_at);
            let last: jiff::Timestamp = last
                .parse()
                .map_err(|_| format_err_t!(Internal, format!("bad timestamp {:?} for batch {}", last, id)))?;
            if now.duration_since(last) >= jiff::SignedDuration::from_secs(min_age_seconds) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Transitions a batch from `from` to `to`, failing if it isn't
    /// currently in `from` (guards against racing finalizer runs).
    pub fn set_batch_status(&self, batch_id: i64, from: BatchStatus, to: BatchStatus) -> Result<(), Error> {
        let now = self.now();
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute(
                "update task_batches set status = ?1, updated_at = ?2 where id = ?3 and status = ?4",
                params![to, now, batch_id, from],
            )
            .err_kind(ErrorKind::Internal)?;
        if n == 0 {
            bail_t!(FailedPrecondition, "batch {} is not in {} status", batch_id, from);
        }
        Ok(())
    }

    pub fn set_batch_final_paths(
        &self,
        batch_id: i64,
        final_mp4_path: Option<&str>,
        final_mp3_path: Option<&str>,
    ) -> Result<(), Error> {
        let now = self.now();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "update task_batches set final_mp4_path = coalesce(?1, final_mp4_path), \
             final_mp3_path = coalesce(?2, final_mp3_path), updated_at = ?3 where id = ?4",
            params![final_mp4_path, final_mp3_path, now, batch_id],
        )
        .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    /// Finalizes a batch: marks it `completed`, and marks every
    /// `pending_files` row it staged as `completed` with the given
    /// start/end times (spec §4.6).
    pub fn complete_batch(&self, batch_id: i64, start_time: &str, end_time: &str) -> Result<(), Error> {
        let now = self.now();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().err_kind(ErrorKind::Internal)?;
        let n = tx
            .execute(
                "update task_batches set status = 'completed', updated_at = ?1 \
                 where id = ?2 and status = 'extracting_mp3'",
                params![now, batch_id],
            )
            .err_kind(ErrorKind::Internal)?;
        if n == 0 {
            bail_t!(FailedPrecondition, "batch {} is not in extracting_mp3 status", batch_id);
        }
        tx.execute(
            "update pending_files set status = 'completed', start_time = ?1, end_time = ?2, \
             updated_at = ?3 where id in \
             (select pending_file_id from task_batch_files where batch_id = ?4 and pending_file_id is not null)",
            params![start_time, end_time, now, batch_id],
        )
        .err_kind(ErrorKind::Internal)?;
        tx.commit().err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    /// Marks a batch `failed`, from whichever in-flight status it was in
    /// when the failure happened — the finalizer calls this from
    /// `merging`/`extracting_mp3` as readily as from `encoding` (spec §7:
    /// "failure during merge or MP3 extract: transition batch to failed").
    pub fn fail_batch(&self, batch_id: i64) -> Result<(), Error> {
        let now = self.now();
        let conn = self.conn.lock().unwrap();
        let n = conn
            .execute(
                "update task_batches set status = 'failed', updated_at = ?1 \
                 where id = ?2 and status in ('encoding', 'merging', 'extracting_mp3')",
                params![now, batch_id],
            )
            .err_kind(ErrorKind::Internal)?;
        if n == 0 {
            bail_t!(FailedPrecondition, "batch {} is not in an in-flight status", batch_id);
        }
        Ok(())
    }

    /// Crash recovery (spec §8): any `task_batch_files` row left `encoding` after
    /// an unclean shutdown goes back to `pending` so the encoder pool
    /// retries it.
    pub fn rollback_encoding_files(&self) -> Result<usize, Error> {
        let now = self.now();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "update task_batch_files set status = 'pending', updated_at = ?1 where status = 'encoding'",
            params![now],
        )
        .err_kind(ErrorKind::Internal)
    }

    /// Crash recovery (spec §8): any batch left `merging` or
    /// `extracting_mp3` after an unclean shutdown goes back to `encoding` so
    /// the finalizer re-attempts the merge from scratch.
    pub fn rollback_batch_status(&self) -> Result<usize, Error> {
        let now = self.now();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "update task_batches set status = 'encoding', updated_at = ?1 \
             where status in ('merging', 'extracting_mp3')",
            params![now],
        )
        .err_kind(ErrorKind::Internal)
    }

    /// Returns disk usage in bytes of the store's backing file, or `None`
    /// for an in-memory database. Used by `GET /api/disk-usage`.
    pub fn on_disk_size(&self, path: &Path) -> Result<u64, Error> {
        std::fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| format_err_t!(Internal, format!("stat {}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::open_test_store;

    const FP_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const FP_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    #[test]
    fn rejects_non_hex_fingerprint() {
        let store = open_test_store();
        let e = store
            .upsert_observation("/videos/alice", "a.flv", "not-hex")
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn observation_lifecycle_counts_and_resets() {
        let store = open_test_store();
        assert_eq!(
            store.upsert_observation("/videos/alice", "a.flv", FP_A).unwrap(),
            ObservationOutcome::Created
        );
        assert_eq!(
            store.upsert_observation("/videos/alice", "a.flv", FP_A).unwrap(),
            ObservationOutcome::Incremented
        );
        assert_eq!(
            store.upsert_observation("/videos/alice", "a.flv", FP_B).unwrap(),
            ObservationOutcome::FingerprintReset
        );
        let f = store.get_pending_file("/videos/alice", "a.flv").unwrap().unwrap();
        assert_eq!(f.stable_count, 1);
        assert_eq!(f.fingerprint, FP_B);

        store.mark_stable("/videos/alice", "a.flv").unwrap();
        assert_eq!(
            store.upsert_observation("/videos/alice", "a.flv", FP_B).unwrap(),
            ObservationOutcome::Ignored
        );
    }

    #[test]
    fn find_stable_with_min_count_filters_by_threshold() {
        let store = open_test_store();
        store.upsert_observation("/v", "a.flv", FP_A).unwrap();
        store.upsert_observation("/v", "a.flv", FP_A).unwrap();
        store.upsert_observation("/v", "a.flv", FP_A).unwrap();
        store.upsert_observation("/v", "b.flv", FP_B).unwrap();

        let stable = store.find_stable_with_min_count(3).unwrap();
        assert_eq!(stable.len(), 1);
        assert_eq!(stable[0].filename, "a.flv");
    }

    #[test]
    fn claim_stable_files_atomically_moves_to_processing() {
        let store = open_test_store();
        store.upsert_observation("/v", "a.flv", FP_A).unwrap();
        store.mark_stable("/v", "a.flv").unwrap();

        let claimed = store.claim_stable_files().unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, PendingFileStatus::Processing);

        // A second claim sees nothing left to claim.
        assert!(store.claim_stable_files().unwrap().is_empty());
    }

    #[test]
    fn rollback_to_stable_reverts_processing_rows() {
        let store = open_test_store();
        store.upsert_observation("/v", "a.flv", FP_A).unwrap();
        store.mark_stable("/v", "a.flv").unwrap();
        store.claim_stable_files().unwrap();

        let n = store.rollback_to_stable().unwrap();
        assert_eq!(n, 1);
        let f = store.get_pending_file("/v", "a.flv").unwrap().unwrap();
        assert_eq!(f.status, PendingFileStatus::Stable);
    }

    fn claim_and_batch(store: &Store<base::clock::SimulatedClocks>) -> i64 {
        store.upsert_observation("/v", "a.flv", FP_A).unwrap();
        store.upsert_observation("/v", "b.flv", FP_B).unwrap();
        store.mark_stable("/v", "a.flv").unwrap();
        store.mark_stable("/v", "b.flv").unwrap();
        let claimed = store.claim_stable_files().unwrap();
        let files: Vec<NewBatchFile> = claimed
            .iter()
            .map(|f| NewBatchFile {
                dir_path: f.dir_path.clone(),
                filename: f.filename.clone(),
                fingerprint: f.fingerprint.clone(),
                pending_file_id: f.id,
            })
            .collect();
        store
            .create_batch_with_files("alice", "/out/alice", "/tmp/alice", &files)
            .unwrap()
    }

    #[test]
    fn create_batch_with_files_stages_sources() {
        let store = open_test_store();
        let batch_id = claim_and_batch(&store);
        let batch = store.get_batch(batch_id).unwrap().unwrap();
        assert_eq!(batch.total_files, 2);
        assert_eq!(batch.status, BatchStatus::Encoding);

        let a = store.get_pending_file("/v", "a.flv").unwrap().unwrap();
        assert_eq!(a.status, PendingFileStatus::Staged);
    }

    #[test]
    fn encoded_plus_failed_never_exceeds_total() {
        let store = open_test_store();
        let batch_id = claim_and_batch(&store);
        store.mark_file_encoded(batch_id, "/v", "a.flv", "/tmp/alice/a.mp4").unwrap();
        store
            .delete_batchfile_and_incr_failed(batch_id, "/v", "b.flv")
            .unwrap();
        let batch = store.get_batch(batch_id).unwrap().unwrap();
        assert_eq!(batch.encoded_count, 1);
        assert_eq!(batch.failed_count, 1);
        assert!(batch.encoded_count + batch.failed_count <= batch.total_files);
    }

    #[test]
    fn find_complete_batch_ids_requires_all_files_resolved() {
        let store = open_test_store();
        let batch_id = claim_and_batch(&store);
        assert!(store.find_complete_batch_ids(0).unwrap().is_empty());

        store.mark_file_encoded(batch_id, "/v", "a.flv", "/tmp/alice/a.mp4").unwrap();
        assert!(store.find_complete_batch_ids(0).unwrap().is_empty());

        store
            .delete_batchfile_and_incr_failed(batch_id, "/v", "b.flv")
            .unwrap();
        assert_eq!(store.find_complete_batch_ids(0).unwrap(), vec![batch_id]);
    }

    #[test]
    fn find_complete_batch_ids_respects_quiescence() {
        let store = open_test_store();
        let batch_id = claim_and_batch(&store);
        store.mark_file_encoded(batch_id, "/v", "a.flv", "/tmp/alice/a.mp4").unwrap();
        store
            .delete_batchfile_and_incr_failed(batch_id, "/v", "b.flv")
            .unwrap();

        assert_eq!(store.find_complete_batch_ids(60).unwrap(), Vec::<i64>::new());
        store.clocks.sleep(std::time::Duration::from_secs(61));
        assert_eq!(store.find_complete_batch_ids(60).unwrap(), vec![batch_id]);
    }

    #[test]
    fn complete_batch_marks_pending_files_completed() {
        let store = open_test_store();
        let batch_id = claim_and_batch(&store);
        store.mark_file_encoded(batch_id, "/v", "a.flv", "/tmp/alice/a.mp4").unwrap();
        store.mark_file_encoded(batch_id, "/v", "b.flv", "/tmp/alice/b.mp4").unwrap();

        store
            .set_batch_status(batch_id, BatchStatus::Encoding, BatchStatus::Merging)
            .unwrap();
        store
            .set_batch_status(batch_id, BatchStatus::Merging, BatchStatus::ExtractingMp3)
            .unwrap();
        store
            .complete_batch(batch_id, "2026-01-01T00:00:00Z", "2026-01-01T01:00:00Z")
            .unwrap();

        let batch = store.get_batch(batch_id).unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        let a = store.get_pending_file("/v", "a.flv").unwrap().unwrap();
        assert_eq!(a.status, PendingFileStatus::Completed);
        assert_eq!(a.start_time.as_deref(), Some("2026-01-01T00:00:00Z"));
    }

    #[test]
    fn retry_increments_and_resets_to_pending() {
        let store = open_test_store();
        let batch_id = claim_and_batch(&store);
        store.mark_batchfile_encoding(batch_id, "/v", "a.flv").unwrap();
        let retries = store.increment_batchfile_retry(batch_id, "/v", "a.flv").unwrap();
        assert_eq!(retries, 1);
        let files = store.list_batch_files_with_status(batch_id, BatchFileStatus::Pending).unwrap();
        assert!(files.iter().any(|f| f.filename == "a.flv"));
    }

    #[test]
    fn rollback_encoding_files_and_batch_status_recover_from_crash() {
        let store = open_test_store();
        let batch_id = claim_and_batch(&store);
        store.mark_batchfile_encoding(batch_id, "/v", "a.flv").unwrap();
        store
            .set_batch_status(batch_id, BatchStatus::Encoding, BatchStatus::Merging)
            .unwrap();

        assert_eq!(store.rollback_encoding_files().unwrap(), 1);
        assert_eq!(store.rollback_batch_status().unwrap(), 1);

        let batch = store.get_batch(batch_id).unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::Encoding);
        let files = store.list_batch_files_with_status(batch_id, BatchFileStatus::Pending).unwrap();
        assert!(files.iter().any(|f| f.filename == "a.flv"));
    }

    #[test]
    fn delete_pending_file_removes_row() {
        let store = open_test_store();
        store.upsert_observation("/v", "a.flv", FP_A).unwrap();
        let id = store.get_pending_file("/v", "a.flv").unwrap().unwrap().id;
        store.delete_pending_file(id).unwrap();
        assert!(store.get_pending_file_by_id(id).unwrap().is_none());
    }
}
