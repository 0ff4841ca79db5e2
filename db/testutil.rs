// This file is part of vodwatch, a stream-recording batch transcode
// and archival daemon.
// Copyright (C) 2026 The Vodwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Test-only helpers for constructing a `Store` without touching disk or
//! real time.

use crate::Store;
use base::clock::SimulatedClocks;

/// Opens an in-memory store driven by a `SimulatedClocks`, for deterministic
/// tests of time-dependent behavior (stability thresholds, retry backoff).
pub fn open_test_store() -> Store<SimulatedClocks> {
    Store::open_in_memory(SimulatedClocks::default()).expect("open in-memory store")
}
