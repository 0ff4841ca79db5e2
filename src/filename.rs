// This file is part of vodwatch, a stream-recording batch transcode
// and archival daemon.
// Copyright (C) 2026 The Vodwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Filename time and streamer-id parsing (spec §4.4).

use jiff::civil::DateTime;
use jiff::Zoned;
use regex::Regex;
use std::sync::OnceLock;

fn bracketed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\[(\d{4})-(\d{2})-(\d{2}) (\d{2})-(\d{2})-(\d{2})\]").unwrap()
    })
}

fn concatenated_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{8})-(\d{6})").unwrap())
}

/// Parses a filename's embedded recording time per spec §4.4's two
/// patterns, first-match wins. Returns `None` for filenames with no
/// recognizable timestamp.
pub fn parse_time(filename: &str) -> Option<Zoned> {
    if let Some(c) = bracketed_re().captures(filename) {
        return build(&c[1], &c[2], &c[3], &c[4], &c[5], &c[6]);
    }
    if let Some(c) = concatenated_re().captures(filename) {
        let ymd = &c[1];
        let hms = &c[2];
        return build(&ymd[0..4], &ymd[4..6], &ymd[6..8], &hms[0..2], &hms[2..4], &hms[4..6]);
    }
    None
}

fn build(y: &str, mo: &str, d: &str, h: &str, mi: &str, s: &str) -> Option<Zoned> {
    let dt = DateTime::new(
        y.parse().ok()?,
        mo.parse().ok()?,
        d.parse().ok()?,
        h.parse().ok()?,
        mi.parse().ok()?,
        s.parse().ok()?,
        0,
    )
    .ok()?;
    dt.to_zoned(jiff::tz::TimeZone::system()).ok()
}

/// Extracts a streamer identifier from a filename: everything before the
/// first `_` or `[`. `MergerService::parseTitle` (original_source's
/// `BatchTaskService.cc`) calls an equivalent of this, but its body isn't
/// among the supplied sources, so this heuristic is original logic rather
/// than a ported one. Returns `None` if the filename starts with one of
/// those separators (nothing to extract).
pub fn parse_streamer(filename: &str) -> Option<String> {
    let end = filename
        .char_indices()
        .find(|&(_, c)| c == '_' || c == '[')
        .map(|(i, _)| i)
        .unwrap_or(filename.len());
    if end == 0 {
        return None;
    }
    Some(filename[..end].to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bracketed_prefix() {
        let t = parse_time("[2025-01-01 00-00-00]alice.flv").unwrap();
        assert_eq!(t.year(), 2025);
        assert_eq!(t.month(), 1);
        assert_eq!(t.hour(), 0);
    }

    #[test]
    fn parses_concatenated_anywhere() {
        let t = parse_time("alice_20250615-143000_raw.flv").unwrap();
        assert_eq!(t.year(), 2025);
        assert_eq!(t.month(), 6);
        assert_eq!(t.day(), 15);
        assert_eq!(t.hour(), 14);
        assert_eq!(t.minute(), 30);
    }

    #[test]
    fn bracketed_pattern_wins_when_both_present() {
        let t = parse_time("[2025-01-01 00-00-00]alice_20250615-143000.flv").unwrap();
        assert_eq!(t.month(), 1);
        assert_eq!(t.day(), 1);
    }

    #[test]
    fn returns_none_for_unparseable_filename() {
        assert!(parse_time("no_timestamp_here.flv").is_none());
    }

    #[test]
    fn parses_streamer_up_to_underscore_or_bracket() {
        assert_eq!(parse_streamer("alice_20250615-143000.flv").as_deref(), Some("alice"));
        assert_eq!(
            parse_streamer("bob[2025-01-01 00-00-00].flv").as_deref(),
            Some("bob")
        );
    }

    #[test]
    fn leading_separator_has_no_streamer() {
        assert_eq!(parse_streamer("_orphan.flv"), None);
        assert_eq!(parse_streamer("[2025-01-01 00-00-00]bob.flv"), None);
    }
}
