// This file is part of vodwatch, a stream-recording batch transcode
// and archival daemon.
// Copyright (C) 2026 The Vodwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Parses ffmpeg-style progress lines into a small snapshot struct (spec
//! §4.5 step 5).

use regex::Regex;
use std::sync::OnceLock;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Progress {
    pub frame: Option<u64>,
    pub fps: Option<f64>,
    pub time: Option<String>,
    pub bitrate: Option<String>,
    pub size: Option<String>,
}

fn frame_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"frame=\s*(\d+)").unwrap())
}
fn fps_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"fps=\s*([\d.]+)").unwrap())
}
fn time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"time=\s*(\d{2}:\d{2}:\d{2}\.\d+)").unwrap())
}
fn bitrate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"bitrate=\s*([\d.]+\s*\S+)").unwrap())
}
fn size_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"size=\s*(\d+\S*)").unwrap())
}

/// Extracts whichever of the five fields are present on `line`. Lines with
/// none of the expected fields yield `None` (most encoder stderr chatter
/// isn't a progress line at all).
pub fn parse_line(line: &str) -> Option<Progress> {
    let frame = frame_re().captures(line).and_then(|c| c[1].parse().ok());
    let fps = fps_re().captures(line).and_then(|c| c[1].parse().ok());
    let time = time_re().captures(line).map(|c| c[1].to_owned());
    let bitrate = bitrate_re().captures(line).map(|c| c[1].trim().to_owned());
    let size = size_re().captures(line).map(|c| c[1].to_owned());
    if frame.is_none() && fps.is_none() && time.is_none() && bitrate.is_none() && size.is_none() {
        return None;
    }
    Some(Progress { frame, fps, time, bitrate, size })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_progress_line() {
        let line = "frame=  123 fps= 25 q=28.0 size=    256kB time=00:00:05.00 bitrate= 419.4kbits/s speed=1.0x";
        let p = parse_line(line).unwrap();
        assert_eq!(p.frame, Some(123));
        assert_eq!(p.fps, Some(25.0));
        assert_eq!(p.time.as_deref(), Some("00:00:05.00"));
        assert_eq!(p.bitrate.as_deref(), Some("419.4kbits/s"));
        assert_eq!(p.size.as_deref(), Some("256kB"));
    }

    #[test]
    fn non_progress_line_yields_none() {
        assert!(parse_line("Input #0, matroska,webm, from 'a.flv':").is_none());
    }
}
