// This file is part of vodwatch, a stream-recording batch transcode
// and archival daemon.
// Copyright (C) 2026 The Vodwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Whitelist/blacklist filter rule evaluation (spec §4.2), shared by the
//! scanner's directory/file filters and the finalizer's delete-rule
//! evaluation (spec §4.6).

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    Whitelist,
    #[default]
    Blacklist,
}

#[derive(Copy, Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    Exact,
    Glob,
    Regex,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct FilterRule {
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub pattern: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct FilterConfig {
    #[serde(default)]
    pub filter_mode: FilterMode,
    #[serde(default)]
    pub rules: Vec<FilterRule>,
}

/// Converts a shell-style glob (`*`, `?`) into an anchored regex, escaping
/// every other regex metacharacter.
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 2);
    out.push('^');
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

impl FilterRule {
    fn matches(&self, candidate: &str) -> bool {
        match self.rule_type {
            RuleType::Exact => candidate == self.pattern,
            RuleType::Glob => Regex::new(&glob_to_regex(&self.pattern))
                .map(|re| re.is_match(candidate))
                .unwrap_or(false),
            RuleType::Regex => Regex::new(&self.pattern)
                .map(|re| re.is_match(candidate))
                .unwrap_or(false),
        }
    }
}

impl FilterConfig {
    /// True iff `candidate` is accepted by this filter: a whitelist accepts
    /// only what matches a rule (so an empty rule set denies everything); a
    /// blacklist accepts everything except what matches a rule (so an empty
    /// rule set allows everything). Rule match is OR across rules.
    pub fn accepts(&self, candidate: &str) -> bool {
        let any_match = self.rules.iter().any(|r| r.matches(candidate));
        match self.filter_mode {
            FilterMode::Whitelist => any_match,
            FilterMode::Blacklist => !any_match,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(t: RuleType, pattern: &str) -> FilterRule {
        FilterRule {
            rule_type: t,
            pattern: pattern.to_owned(),
        }
    }

    #[test]
    fn whitelist_with_no_rules_denies_all() {
        let f = FilterConfig {
            filter_mode: FilterMode::Whitelist,
            rules: vec![],
        };
        assert!(!f.accepts("anything"));
    }

    #[test]
    fn blacklist_with_no_rules_allows_all() {
        let f = FilterConfig {
            filter_mode: FilterMode::Blacklist,
            rules: vec![],
        };
        assert!(f.accepts("anything"));
    }

    #[test]
    fn exact_rule_matches_equality_only() {
        let f = FilterConfig {
            filter_mode: FilterMode::Whitelist,
            rules: vec![rule(RuleType::Exact, "alice")],
        };
        assert!(f.accepts("alice"));
        assert!(!f.accepts("alice2"));
    }

    #[test]
    fn glob_rule_translates_wildcards() {
        let f = FilterConfig {
            filter_mode: FilterMode::Whitelist,
            rules: vec![rule(RuleType::Glob, "*.flv")],
        };
        assert!(f.accepts("clip.flv"));
        assert!(!f.accepts("clip.mp4"));
    }

    #[test]
    fn regex_rule_is_unanchored_search() {
        let f = FilterConfig {
            filter_mode: FilterMode::Blacklist,
            rules: vec![rule(RuleType::Regex, r"^priv_")],
        };
        assert!(f.accepts("public_stream.flv"));
        assert!(!f.accepts("priv_stream.flv"));
    }

    #[test]
    fn rule_match_is_or_across_rules() {
        let f = FilterConfig {
            filter_mode: FilterMode::Whitelist,
            rules: vec![rule(RuleType::Exact, "a"), rule(RuleType::Exact, "b")],
        };
        assert!(f.accepts("a"));
        assert!(f.accepts("b"));
        assert!(!f.accepts("c"));
    }
}
