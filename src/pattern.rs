//! Channel-code blacklists built on `glob` patterns.
//!
//! Patterns use the usual glob syntax: `*` for any run, `?` for one character and
//! `[...]` for a character class. They are compiled once when the blacklist is built
//! and matched case-insensitively against channel codes.

use crate::error::{AppResult, CacheError};
use glob::{MatchOptions, Pattern};

const CHANNEL_CODE_MATCH: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// A compiled list of channel-code patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blacklist {
    patterns: Vec<Pattern>,
}

impl Blacklist {
    /// Compiles a blacklist, discarding blank patterns.
    ///
    /// Fails with [`CacheError::Configuration`] on the first malformed pattern.
    pub fn new<I, S>(patterns: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| p.as_ref().trim().to_uppercase())
            .filter(|p| !p.is_empty())
            .map(|p| {
                Pattern::new(&p).map_err(|e| {
                    CacheError::Configuration(format!("Invalid blacklist pattern '{p}': {e}"))
                })
            })
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// True when any pattern matches `code`.
    pub fn matches(&self, code: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| p.matches_with(code, CHANNEL_CODE_MATCH))
    }

    /// True when no patterns are configured.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The normalized pattern sources.
    pub fn patterns(&self) -> Vec<&str> {
        self.patterns.iter().map(Pattern::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(patterns: &[&str]) -> Blacklist {
        Blacklist::new(patterns).unwrap()
    }

    #[test]
    fn test_literal_patterns() {
        assert!(list(&["HHZ"]).matches("HHZ"));
        assert!(!list(&["HHZ"]).matches("HHN"));
        assert!(list(&["hhz"]).matches("HHZ"));
        assert!(list(&["HHZ"]).matches("hhz"));
    }

    #[test]
    fn test_star_matches_any_run() {
        let lh = list(&["LH*"]);
        assert!(lh.matches("LHZ"));
        assert!(lh.matches("LH"));
        assert!(!lh.matches("HHZ"));
        assert!(list(&["*Z"]).matches("HHZ"));
        assert!(list(&["H*N*"]).matches("HHNX"));
        assert!(list(&["*HZ"]).matches("HHHZ"));
        assert!(!list(&["*HZ"]).matches("HHZN"));
    }

    #[test]
    fn test_question_matches_one() {
        let any_band = list(&["?HZ"]);
        assert!(any_band.matches("EHZ"));
        assert!(!any_band.matches("HZ"));
        assert!(!list(&["??"]).matches("HHZ"));
    }

    #[test]
    fn test_character_classes() {
        let horizontals = list(&["HH[NE]"]);
        assert!(horizontals.matches("HHN"));
        assert!(horizontals.matches("hhe"));
        assert!(!horizontals.matches("HHZ"));
    }

    #[test]
    fn test_malformed_pattern_is_rejected() {
        let err = Blacklist::new(["LH*", "HH["]).unwrap_err();
        assert!(matches!(err, CacheError::Configuration(ref m) if m.contains("HH[")));
    }

    #[test]
    fn test_blacklist_ignores_blank_patterns() {
        let list = list(&["LH*", " ", "acc"]);
        assert_eq!(list.patterns(), vec!["LH*", "ACC"]);
        assert!(list.matches("LHZ"));
        assert!(list.matches("ACC"));
        assert!(!list.matches("HHZ"));
        assert!(Blacklist::default().is_empty());
    }
}
