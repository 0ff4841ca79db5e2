// This file is part of vodwatch, a stream-recording batch transcode
// and archival daemon.
// Copyright (C) 2026 The Vodwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Read-only verification of the universal invariants (spec §8). Exits
//! non-zero if anything is inconsistent; never mutates the database.

use base::clock::RealClocks;
use base::Error;
use bpaf::Bpaf;
use db::{BatchStatus, PendingFileStatus};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::warn;

#[derive(Bpaf, Debug)]
#[bpaf(command("check"))]
pub struct Args {
    /// Path to the SQLite3 database file.
    #[bpaf(long, argument("PATH"), fallback(PathBuf::from(crate::DEFAULT_DB_PATH)))]
    db_path: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let store = db::Store::open(&args.db_path, RealClocks {})?;
    let mut problems = 0usize;

    for f in store.list_pending_files(None)? {
        let needs_fingerprint = matches!(
            f.status,
            PendingFileStatus::Stable
                | PendingFileStatus::Processing
                | PendingFileStatus::Staged
                | PendingFileStatus::Completed
        );
        if needs_fingerprint && !is_valid_fingerprint(&f.fingerprint) {
            warn!(id = f.id, path = %f.filepath().display(), "invariant violated: invalid fingerprint for {:?}", f.status);
            problems += 1;
        }
    }

    let completed: Vec<_> = store
        .list_pending_files(Some(PendingFileStatus::Completed))?;
    let mut by_fingerprint: HashMap<&str, usize> = HashMap::new();
    for f in &completed {
        *by_fingerprint.entry(f.fingerprint.as_str()).or_default() += 1;
    }
    for f in store.list_pending_files(None)? {
        if f.status == PendingFileStatus::Completed {
            continue;
        }
        if matches!(f.status, PendingFileStatus::Deprecated) {
            continue;
        }
        if by_fingerprint.contains_key(f.fingerprint.as_str()) {
            warn!(id = f.id, "invariant violated: {:?} row shares a fingerprint with a completed file", f.status);
            problems += 1;
        }
    }

    for batch in store.list_batches(None)? {
        if batch.status == BatchStatus::Completed {
            match &batch.final_mp4_path {
                Some(p) if !p.is_empty() && std::path::Path::new(p).exists() => {}
                _ => {
                    warn!(batch = batch.id, "invariant violated: completed batch missing final_mp4_path on disk");
                    problems += 1;
                }
            }
        }
        if batch.encoded_count + batch.failed_count > batch.total_files {
            warn!(batch = batch.id, "invariant violated: encoded_count + failed_count > total_files");
            problems += 1;
        }
        if matches!(batch.status, BatchStatus::Completed | BatchStatus::Failed)
            && batch.encoded_count + batch.failed_count != batch.total_files
        {
            warn!(batch = batch.id, "invariant violated: terminal batch with unaccounted-for files");
            problems += 1;
        }
    }

    if problems == 0 {
        tracing::info!("no invariant violations found");
        Ok(0)
    } else {
        tracing::error!(problems, "invariant violations found");
        Ok(1)
    }
}

fn is_valid_fingerprint(s: &str) -> bool {
    s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit())
}
