// This file is part of vodwatch, a stream-recording batch transcode
// and archival daemon.
// Copyright (C) 2026 The Vodwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Row types and status enums for the three persisted entities.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use std::path::PathBuf;

macro_rules! sql_enum {
    ($name:ident { $($variant:ident => $sql:literal),+ $(,)? }) => {
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $sql),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($sql => Ok(Self::$variant),)+
                    _ => Err(format!(concat!("invalid ", stringify!($name), ": {}"), s)),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let s = value.as_str()?;
                s.parse().map_err(|_| FromSqlError::InvalidType)
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }
    };
}

sql_enum!(PendingFileStatus {
    Pending => "pending",
    Stable => "stable",
    Processing => "processing",
    Staged => "staged",
    Completed => "completed",
    Deprecated => "deprecated",
});

sql_enum!(BatchStatus {
    Encoding => "encoding",
    Merging => "merging",
    ExtractingMp3 => "extracting_mp3",
    Completed => "completed",
    Failed => "failed",
});

sql_enum!(BatchFileStatus {
    Pending => "pending",
    Encoding => "encoding",
    Encoded => "encoded",
    Failed => "failed",
});

/// The outcome of [`crate::store::Store::upsert_observation`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ObservationOutcome {
    /// No row existed for this path; one was created with `stable_count = 1`.
    Created,
    /// The row existed, was `pending`, and had the same fingerprint;
    /// `stable_count` was incremented.
    Incremented,
    /// The row existed but the fingerprint changed; `stable_count` was reset to 1.
    FingerprintReset,
    /// The row existed, was not `pending`, and had the same fingerprint; nothing changed.
    Ignored,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PendingFile {
    pub id: i64,
    pub dir_path: String,
    pub filename: String,
    pub fingerprint: String,
    pub stable_count: i64,
    pub status: PendingFileStatus,
    pub temp_mp4_path: Option<String>,
    pub temp_mp3_path: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub updated_at: String,
}

impl PendingFile {
    /// The full filesystem path this row refers to, per spec's standardized
    /// `dir_path` + `filename` pair.
    pub fn filepath(&self) -> PathBuf {
        PathBuf::from(&self.dir_path).join(&self.filename)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub id: i64,
    pub streamer: String,
    pub status: BatchStatus,
    pub output_dir: String,
    pub tmp_dir: String,
    pub final_mp4_path: Option<String>,
    pub final_mp3_path: Option<String>,
    pub total_files: i64,
    pub encoded_count: i64,
    pub failed_count: i64,
    pub updated_at: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BatchFile {
    pub id: i64,
    pub batch_id: i64,
    pub dir_path: String,
    pub filename: String,
    pub fingerprint: String,
    pub pending_file_id: Option<i64>,
    pub status: BatchFileStatus,
    pub encoded_path: Option<String>,
    pub retry_count: i64,
    pub updated_at: String,
}

impl BatchFile {
    pub fn filepath(&self) -> PathBuf {
        PathBuf::from(&self.dir_path).join(&self.filename)
    }
}

/// A file to be added to a batch, as produced by the batcher (§4.4) and
/// consumed by `create_batch_with_files`/`add_files_to_batch`.
#[derive(Clone, Debug)]
pub struct NewBatchFile {
    pub dir_path: String,
    pub filename: String,
    pub fingerprint: String,
    pub pending_file_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn pending_file_status_roundtrips_through_str() {
        for s in [
            PendingFileStatus::Pending,
            PendingFileStatus::Stable,
            PendingFileStatus::Processing,
            PendingFileStatus::Staged,
            PendingFileStatus::Completed,
            PendingFileStatus::Deprecated,
        ] {
            assert_eq!(PendingFileStatus::from_str(s.as_str()).unwrap(), s);
        }
    }

    #[test]
    fn filepath_joins_dir_and_name() {
        let f = PendingFile {
            id: 1,
            dir_path: "/videos/alice".into(),
            filename: "[2026-01-01 00-00-00]alice.flv".into(),
            fingerprint: "0".repeat(32),
            stable_count: 3,
            status: PendingFileStatus::Stable,
            temp_mp4_path: None,
            temp_mp3_path: None,
            start_time: None,
            end_time: None,
            updated_at: "2026-01-01T00:00:00Z".into(),
        };
        assert_eq!(
            f.filepath(),
            PathBuf::from("/videos/alice/[2026-01-01 00-00-00]alice.flv")
        );
    }
}
