// This file is part of vodwatch, a stream-recording batch transcode
// and archival daemon.
// Copyright (C) 2026 The Vodwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Subcommand implementations. Each owns a `bpaf`-derived `Args` struct and
//! a `run` function, per `main.rs`'s dispatch.

pub mod check;
pub mod init;
pub mod run;
