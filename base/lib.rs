// This file is part of vodwatch, a stream-recording batch transcode
// and archival daemon.
// Copyright (C) 2026 The Vodwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

// Domain-agnostic building blocks shared by `db` and the top-level binary:
// a classified error type, a mockable clock, string helpers, tracing setup,
// and a graceful-shutdown signal.

pub mod clock;
mod error;
pub mod shutdown;
pub mod strutil;
pub mod tracing_setup;

pub use crate::error::{prettify_failure, Error, ErrorKind, ResultExt};
