// This file is part of vodwatch, a stream-recording batch transcode
// and archival daemon.
// Copyright (C) 2026 The Vodwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The `AppConfig` snapshot (spec §6) and its TOML loading, grounded on
//! `cmds::run::config::ConfigFile`'s shape but using `toml`+`serde` rather
//! than `serde_json`, per DESIGN.md.

use crate::filter::{FilterConfig, FilterRule};
use base::{format_err_t, Error, ErrorKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct RootConfig {
    pub path: PathBuf,
    #[serde(flatten)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub enable_delete: bool,
    #[serde(default)]
    pub delete_mode: crate::filter::FilterMode,
    #[serde(default)]
    pub delete_rules: Vec<FilterRule>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ScannerConfig {
    pub video_roots: Vec<RootConfig>,
    pub extensions: Vec<String>,
    #[serde(default)]
    pub allow_list: Option<String>,
    #[serde(default)]
    pub deny_list: Option<String>,
    #[serde(default)]
    pub simple_allow_list: Option<String>,
    #[serde(default)]
    pub simple_deny_list: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct OutputConfig {
    pub output_root: PathBuf,
    #[serde(default)]
    pub keep_original: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SchedulerConfig {
    pub scan_interval_seconds: u64,
    pub merge_window_hours: f64,
    #[serde(default = "default_stability_threshold")]
    pub stability_threshold: i64,
    #[serde(default)]
    pub quiescence_seconds: i64,
}

fn default_stability_threshold() -> i64 {
    3
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TempConfig {
    pub temp_dir: PathBuf,
    #[serde(default)]
    pub size_limit_mb: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct EncoderConfig {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_crf")]
    pub crf: u32,
    #[serde(default = "default_preset")]
    pub preset: u32,
    /// Path to the encoder binary; not in spec §6's literal table (which
    /// names the binary as a bare external collaborator) but needed to
    /// actually spawn it. Defaults to `ffmpeg` on `PATH`.
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// How long a cancelled child gets after `SIGTERM` before `SIGKILL`
    /// (spec §5's "waits a short grace period, force-kills").
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

fn default_max_parallel() -> usize {
    2
}
fn default_max_retries() -> u32 {
    2
}
fn default_crf() -> u32 {
    30
}
fn default_preset() -> u32 {
    6
}
fn default_ffmpeg_path() -> String {
    "ffmpeg".to_owned()
}
fn default_shutdown_grace_seconds() -> u64 {
    10
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct AppConfig {
    pub scanner: ScannerConfig,
    pub output: OutputConfig,
    pub scheduler: SchedulerConfig,
    pub temp: TempConfig,
    pub encoder: EncoderConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format_err_t!(Unavailable, format!("reading {}: {}", path.display(), e)))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, Error> {
        toml::from_str(raw)
            .map_err(|e| format_err_t!(InvalidArgument, format!("invalid config: {}", e)))
    }

    pub fn to_toml(&self) -> Result<String, Error> {
        toml::to_string_pretty(self)
            .map_err(|e| format_err_t!(Internal, format!("serializing config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [scanner]
        video_roots = [{ path = "/videos/alice", filter_mode = "blacklist", rules = [] }]
        extensions = [".flv", ".mp4"]

        [output]
        output_root = "/out"

        [scheduler]
        scan_interval_seconds = 30
        merge_window_hours = 1.0

        [temp]
        temp_dir = "/tmp/vodwatch"

        [encoder]
        max_parallel = 2
    "#;

    #[test]
    fn parses_minimal_config() {
        let cfg = AppConfig::parse(SAMPLE).unwrap();
        assert_eq!(cfg.scanner.video_roots.len(), 1);
        assert_eq!(cfg.scheduler.stability_threshold, 3);
        assert_eq!(cfg.encoder.crf, 30);
        assert_eq!(cfg.encoder.ffmpeg_path, "ffmpeg");
    }

    #[test]
    fn rejects_missing_required_field() {
        let e = AppConfig::parse("[scanner]\n").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn roundtrips_through_toml() {
        let cfg = AppConfig::parse(SAMPLE).unwrap();
        let text = cfg.to_toml().unwrap();
        let cfg2 = AppConfig::parse(&text).unwrap();
        assert_eq!(cfg, cfg2);
    }
}
