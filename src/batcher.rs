// This file is part of vodwatch, a stream-recording batch transcode
// and archival daemon.
// Copyright (C) 2026 The Vodwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Groups claimed `stable` files into batches and decides new-batch vs
//! merge-into-existing (spec §4.4).

use crate::filename::{parse_streamer, parse_time};
use db::PendingFile;
use jiff::Zoned;
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug)]
pub enum Target {
    NewBatch,
    ExistingBatch(i64),
}

#[derive(Debug)]
pub struct Assignment {
    pub target: Target,
    pub streamer: String,
    pub files: Vec<PendingFile>,
}

struct Timed {
    file: PendingFile,
    time: Zoned,
}

pub struct Batcher {
    merge_window_seconds: i64,
}

impl Batcher {
    pub fn new(merge_window_hours: f64) -> Self {
        Batcher {
            merge_window_seconds: (merge_window_hours * 3600.0) as i64,
        }
    }

    /// Assigns `claimed` files (expected to be `processing`) to new or
    /// existing batches. `existing_by_streamer` should contain, for each
    /// streamer with at least one `encoding` batch, that batch's id and
    /// the earliest parseable time among its current files — the caller
    /// (Scheduler) is responsible for gathering that from the Store since
    /// the Batcher itself has no Store handle.
    pub fn assign(
        &self,
        claimed: Vec<PendingFile>,
        existing_by_streamer: &HashMap<String, (i64, Zoned)>,
    ) -> Vec<Assignment> {
        let mut by_streamer: HashMap<String, Vec<Timed>> = HashMap::new();
        for file in claimed {
            let Some(time) = parse_time(&file.filename) else {
                warn!(filename = %file.filename, "no parseable time; excluding from batching");
                continue;
            };
            let Some(streamer) = parse_streamer(&file.filename) else {
                warn!(filename = %file.filename, "no parseable streamer; excluding from batching");
                continue;
            };
            by_streamer.entry(streamer).or_default().push(Timed { file, time });
        }

        let mut assignments = Vec::new();
        for (streamer, mut timed) in by_streamer {
            timed.sort_by(|a, b| b.time.timestamp().cmp(&a.time.timestamp()));
            let new_batches = self.form_new_batches(timed);
            let candidate = existing_by_streamer.get(&streamer);
            for batch in new_batches {
                assignments.extend(self.merge_or_emit(&streamer, batch, candidate));
            }
        }
        assignments
    }

    /// Step 3: greedily forms new batches by walking the descending-sorted
    /// list; a file joins the current batch iff the gap to the previous
    /// (newer) file is within the merge window.
    fn form_new_batches(&self, timed: Vec<Timed>) -> Vec<Vec<Timed>> {
        let mut batches: Vec<Vec<Timed>> = Vec::new();
        for t in timed {
            match batches.last_mut() {
                Some(current) if self.within_window(&current.last().unwrap().time, &t.time) => {
                    current.push(t);
                }
                _ => batches.push(vec![t]),
            }
        }
        batches
    }

    fn within_window(&self, newer: &Zoned, older: &Zoned) -> bool {
        let gap = newer.timestamp().duration_since(older.timestamp()).abs();
        gap <= jiff::SignedDuration::from_secs(self.merge_window_seconds)
    }

    /// Steps 4-6: attempts to merge `batch` into the single candidate
    /// existing batch for this streamer, splitting into mergeable and
    /// non-mergeable portions as needed.
    fn merge_or_emit(
        &self,
        streamer: &str,
        batch: Vec<Timed>,
        candidate: Option<&(i64, Zoned)>,
    ) -> Vec<Assignment> {
        let Some((existing_id, earliest_existing_time)) = candidate else {
            return vec![Assignment {
                target: Target::NewBatch,
                streamer: streamer.to_owned(),
                files: batch.into_iter().map(|t| t.file).collect(),
            }];
        };

        let (mergeable, non_mergeable): (Vec<Timed>, Vec<Timed>) = batch
            .into_iter()
            .partition(|t| self.within_window(earliest_existing_time, &t.time));

        let mut out = Vec::new();
        if !mergeable.is_empty() {
            out.push(Assignment {
                target: Target::ExistingBatch(*existing_id),
                streamer: streamer.to_owned(),
                files: mergeable.into_iter().map(|t| t.file).collect(),
            });
        }
        if !non_mergeable.is_empty() {
            out.push(Assignment {
                target: Target::NewBatch,
                streamer: streamer.to_owned(),
                files: non_mergeable.into_iter().map(|t| t.file).collect(),
            });
        }
        out
    }
}

/// Computes the earliest parseable filename time among a batch's current
/// files, for use as `existing_by_streamer`'s per-streamer candidate.
pub fn earliest_time<'a>(filenames: impl Iterator<Item = &'a str>) -> Option<Zoned> {
    filenames.filter_map(parse_time).min_by(|a, b| a.timestamp().cmp(&b.timestamp()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::PendingFileStatus;

    fn file(filename: &str) -> PendingFile {
        PendingFile {
            id: 0,
            dir_path: "/videos".to_owned(),
            filename: filename.to_owned(),
            fingerprint: "0".repeat(32),
            stable_count: 3,
            status: PendingFileStatus::Processing,
            temp_mp4_path: None,
            temp_mp3_path: None,
            start_time: None,
            end_time: None,
            updated_at: "2025-01-01T00:00:00Z".to_owned(),
        }
    }

    #[test]
    fn groups_by_streamer_and_merges_within_window() {
        let batcher = Batcher::new(1.0);
        let claimed = vec![
            file("alice_20250615-120000.flv"),
            file("alice_20250615-123000.flv"),
            file("bob_20250615-120000.flv"),
        ];
        let assignments = batcher.assign(claimed, &HashMap::new());
        assert_eq!(assignments.len(), 2);
        let alice = assignments.iter().find(|a| a.streamer == "alice").unwrap();
        assert_eq!(alice.files.len(), 2);
        assert!(matches!(alice.target, Target::NewBatch));
    }

    #[test]
    fn gap_beyond_window_starts_new_batch() {
        let batcher = Batcher::new(1.0);
        let claimed = vec![
            file("alice_20250615-120000.flv"),
            file("alice_20250615-143000.flv"),
        ];
        let assignments = batcher.assign(claimed, &HashMap::new());
        let alice_batches: Vec<_> = assignments.iter().filter(|a| a.streamer == "alice").collect();
        assert_eq!(alice_batches.len(), 2);
    }

    #[test]
    fn merges_into_existing_batch_within_window() {
        let batcher = Batcher::new(1.0);
        let existing_time = parse_time("alice_20250615-120000.flv").unwrap();
        let mut existing = HashMap::new();
        existing.insert("alice".to_owned(), (42i64, existing_time));

        let claimed = vec![file("alice_20250615-123000.flv")];
        let assignments = batcher.assign(claimed, &existing);
        assert_eq!(assignments.len(), 1);
        assert!(matches!(assignments[0].target, Target::ExistingBatch(42)));
    }

    #[test]
    fn splits_mergeable_and_non_mergeable_against_existing() {
        let batcher = Batcher::new(1.0);
        let existing_time = parse_time("alice_20250615-120000.flv").unwrap();
        let mut existing = HashMap::new();
        existing.insert("alice".to_owned(), (42i64, existing_time));

        let claimed = vec![
            file("alice_20250615-123000.flv"),
            file("alice_20250615-200000.flv"),
        ];
        let assignments = batcher.assign(claimed, &existing);
        assert_eq!(assignments.len(), 2);
        let existing_assignment = assignments
            .iter()
            .find(|a| matches!(a.target, Target::ExistingBatch(_)))
            .unwrap();
        assert_eq!(existing_assignment.files.len(), 1);
        let new_assignment = assignments
            .iter()
            .find(|a| matches!(a.target, Target::NewBatch))
            .unwrap();
        assert_eq!(new_assignment.files.len(), 1);
    }

    #[test]
    fn unparseable_time_excludes_file() {
        let batcher = Batcher::new(1.0);
        let claimed = vec![file("no_timestamp.flv")];
        let assignments = batcher.assign(claimed, &HashMap::new());
        assert!(assignments.is_empty());
    }
}
