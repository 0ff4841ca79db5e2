// This file is part of vodwatch, a stream-recording batch transcode
// and archival daemon.
// Copyright (C) 2026 The Vodwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

mod model;
mod store;
#[cfg(any(test, feature = "test-util"))]
mod testutil;

pub use model::{
    Batch, BatchFile, BatchFileStatus, BatchStatus, NewBatchFile, ObservationOutcome,
    PendingFile, PendingFileStatus,
};
pub use store::Store;

/// Exposed outside `#[cfg(test)]` (behind the `test-util` feature) so sibling
/// crates' own test suites can build a `Store` without reimplementing it.
#[cfg(any(test, feature = "test-util"))]
pub use testutil::open_test_store;

/// The SQL executed by `Store::open` against a fresh (or existing) database.
///
/// Creating the schema is idempotent: `create table` without `if not
/// exists` is intentional here, since `Store::open` only runs it once, after
/// checking `meta` is absent.
pub(crate) const SCHEMA: &str = include_str!("schema.sql");

/// Schema version written to `meta` by a freshly initialized database.
///
/// There is deliberately no upgrade chain (see DESIGN.md): this crate is
/// young enough that schema changes so far have been handled by recreating
/// the database, matching the Non-goal in the spec disclaiming live
/// migrations.
pub(crate) const SCHEMA_VERSION: i64 = 1;
