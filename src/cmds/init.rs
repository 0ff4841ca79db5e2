// This file is part of vodwatch, a stream-recording batch transcode
// and archival daemon.
// Copyright (C) 2026 The Vodwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Creates the database file if it doesn't already exist.

use base::clock::RealClocks;
use base::Error;
use bpaf::Bpaf;
use std::path::PathBuf;
use tracing::info;

#[derive(Bpaf, Debug)]
#[bpaf(command("init"))]
pub struct Args {
    /// Path to the SQLite3 database file.
    #[bpaf(long, argument("PATH"), fallback(PathBuf::from(crate::DEFAULT_DB_PATH)))]
    db_path: PathBuf,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let store = db::Store::open(&args.db_path, RealClocks {})?;
    info!(
        schema_version = store.schema_version()?,
        path = %args.db_path.display(),
        "database ready"
    );
    Ok(0)
}
