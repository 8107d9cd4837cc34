//! Rule matching: first enabled rule whose method filter and path pattern
//! admit the request.

use regex::Regex;

use crate::types::Rule;

/// Compiled form of a rule's `pathPattern`.
///
/// A pattern that fails to compile as a regex degrades to literal substring
/// containment. A user-typed pattern must never abort request handling, so
/// the downgrade happens once at rule construction and matching itself is
/// infallible.
#[derive(Debug, Clone)]
pub enum PathMatcher {
    Pattern(Regex),
    Literal(String),
}

impl PathMatcher {
    pub fn compile(source: &str) -> Self {
        match Regex::new(source) {
            Ok(regex) => PathMatcher::Pattern(regex),
            Err(err) => {
                tracing::debug!("pattern {source:?} is not a valid regex ({err}), matching as substring");
                PathMatcher::Literal(source.to_string())
            }
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatcher::Pattern(regex) => regex.is_match(path),
            PathMatcher::Literal(literal) => path.contains(literal.as_str()),
        }
    }
}

/// Find the first enabled rule, in insertion order, that admits `method`
/// and matches `path`.
pub fn find_matching_rule<'a>(rules: &'a [Rule], path: &str, method: &str) -> Option<&'a Rule> {
    rules
        .iter()
        .filter(|rule| rule.enabled)
        .find(|rule| admits_method(&rule.methods, method) && rule.matcher.matches(path))
}

/// Case-insensitive method check; `*` admits every method.
fn admits_method(methods: &[String], method: &str) -> bool {
    methods
        .iter()
        .any(|m| m == "*" || m.eq_ignore_ascii_case(method))
}
