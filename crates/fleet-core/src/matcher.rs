//! Two-tier pattern matching used for window selection.
//!
//! Patterns come from operator overrides and are frequently hand-written,
//! so an invalid regular expression is not an error: the matcher downgrades
//! to plain substring containment and logs the downgrade once.

use regex::Regex;
use tracing::warn;

/// A compiled pattern: a regex, or a substring when the regex was invalid.
#[derive(Debug, Clone)]
pub enum PatternMatcher {
    Regex(Regex),
    Substring(String),
}

impl PatternMatcher {
    /// Compiles `pattern`, falling back to substring matching if it is not a
    /// valid regular expression.
    pub fn new(pattern: &str) -> Self {
        match Regex::new(pattern) {
            Ok(re) => Self::Regex(re),
            Err(e) => {
                warn!(
                    pattern = %pattern,
                    error = %e,
                    "Invalid pattern, falling back to substring match"
                );
                Self::Substring(pattern.to_string())
            }
        }
    }

    pub fn is_match(&self, candidate: &str) -> bool {
        match self {
            Self::Regex(re) => re.is_match(candidate),
            Self::Substring(s) => candidate.contains(s.as_str()),
        }
    }

    /// Returns true if this matcher downgraded to substring matching.
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Substring(_))
    }

    pub fn pattern(&self) -> &str {
        match self {
            Self::Regex(re) => re.as_str(),
            Self::Substring(s) => s,
        }
    }
}

/// Window selection by class name and title.
///
/// An empty pattern places no constraint on that field. A constrained field
/// never matches an empty candidate value.
#[derive(Debug, Clone, Default)]
pub struct WindowFilter {
    class: Option<PatternMatcher>,
    title: Option<PatternMatcher>,
}

impl WindowFilter {
    pub fn new(class_pattern: &str, title_pattern: &str) -> Self {
        Self {
            class: compile_optional(class_pattern),
            title: compile_optional(title_pattern),
        }
    }

    pub fn is_unconstrained(&self) -> bool {
        self.class.is_none() && self.title.is_none()
    }

    pub fn matches(&self, class_name: &str, title: &str) -> bool {
        field_matches(self.class.as_ref(), class_name) && field_matches(self.title.as_ref(), title)
    }
}

fn compile_optional(pattern: &str) -> Option<PatternMatcher> {
    if pattern.is_empty() {
        None
    } else {
        Some(PatternMatcher::new(pattern))
    }
}

fn field_matches(matcher: Option<&PatternMatcher>, value: &str) -> bool {
    match matcher {
        None => true,
        Some(_) if value.is_empty() => false,
        Some(m) => m.is_match(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_regex_matches() {
        let m = PatternMatcher::new("^Unity.*Class$");
        assert!(!m.is_fallback());
        assert!(m.is_match("UnityWndClass"));
        assert!(!m.is_match("Chrome_WidgetWin_1"));
    }

    #[test]
    fn test_invalid_regex_falls_back_to_substring() {
        let m = PatternMatcher::new("Endfield (");
        assert!(m.is_fallback());
        assert_eq!(m.pattern(), "Endfield (");
        assert!(m.is_match("Arknights Endfield (beta)"));
        assert!(!m.is_match("Arknights Endfield"));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = WindowFilter::new("", "");
        assert!(filter.is_unconstrained());
        assert!(filter.matches("", ""));
        assert!(filter.matches("Any", "Thing"));
    }

    #[test]
    fn test_constrained_field_rejects_empty_candidate() {
        let filter = WindowFilter::new("UnityWndClass", "");
        assert!(!filter.is_unconstrained());
        assert!(!filter.matches("", "Endfield"));
        assert!(filter.matches("UnityWndClass", ""));
    }

    #[test]
    fn test_both_fields_must_match() {
        let filter = WindowFilter::new("Unity", "Endfield");
        assert!(filter.matches("UnityWndClass", "Endfield"));
        assert!(!filter.matches("UnityWndClass", "Notepad"));
        assert!(!filter.matches("Notepad", "Endfield"));
    }
}
