//! Ordered event recognition over a stream of lines.
//!
//! An [`EventPattern`] is an ordered list of named predicates. The
//! [`EventMatcher`] walks the pattern with a single next-expected index:
//! every observed line is tested only against the element at that index, and
//! anything that does not match is ignored as noise. A later element showing
//! up before its predecessor therefore never counts.

use std::fmt;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A textual test applied to one line.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// Line contains the substring.
    Contains(String),
    /// Line is exactly the string.
    Exact(String),
    /// Line matches the regular expression anywhere.
    Regex(Regex),
}

impl Predicate {
    pub fn contains(needle: impl Into<String>) -> Self {
        Self::Contains(needle.into())
    }

    pub fn exact(line: impl Into<String>) -> Self {
        Self::Exact(line.into())
    }

    /// Compile a regex predicate.
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Self::Regex)
    }

    pub fn matches(&self, line: &str) -> bool {
        match self {
            Self::Contains(needle) => line.contains(needle.as_str()),
            Self::Exact(expected) => line == expected,
            Self::Regex(re) => re.is_match(line),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contains(needle) => write!(f, "contains({needle:?})"),
            Self::Exact(expected) => write!(f, "exact({expected:?})"),
            Self::Regex(re) => write!(f, "regex({:?})", re.as_str()),
        }
    }
}

/// One named step of an [`EventPattern`].
#[derive(Debug, Clone)]
pub struct PatternElement {
    pub name: String,
    pub predicate: Predicate,
}

/// Ordered list of predicates that must be satisfied in sequence.
#[derive(Debug, Clone, Default)]
pub struct EventPattern {
    elements: Vec<PatternElement>,
}

impl EventPattern {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a named step.
    pub fn then(mut self, name: impl Into<String>, predicate: Predicate) -> Self {
        self.elements.push(PatternElement {
            name: name.into(),
            predicate,
        });
        self
    }

    /// Build a pattern of substring steps, each named after its needle.
    pub fn contains_all<I, S>(needles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        needles.into_iter().fold(Self::new(), |pattern, needle| {
            let needle = needle.into();
            pattern.then(needle.clone(), Predicate::Contains(needle))
        })
    }

    /// Build a pattern of regex steps, each named after its expression.
    pub fn regex_all<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        patterns.into_iter().try_fold(Self::new(), |pattern, expr| {
            let expr = expr.as_ref();
            Ok(pattern.then(expr, Predicate::regex(expr)?))
        })
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn elements(&self) -> &[PatternElement] {
        &self.elements
    }

    pub fn get(&self, index: usize) -> Option<&PatternElement> {
        self.elements.get(index)
    }
}

/// Record of a pattern element being reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedEvent {
    pub index: usize,
    pub name: String,
    /// The line that satisfied the predicate.
    pub line: String,
    /// 1-based position of that line among all observed lines.
    pub line_number: u64,
    pub reached_at: DateTime<Utc>,
}

/// Progress of one pattern: which elements were reached, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchState {
    names: Vec<String>,
    reached: Vec<Option<MatchedEvent>>,
    next: usize,
    lines_observed: u64,
}

impl MatchState {
    fn for_pattern(pattern: &EventPattern) -> Self {
        Self {
            names: pattern.elements.iter().map(|e| e.name.clone()).collect(),
            reached: vec![None; pattern.len()],
            next: 0,
            lines_observed: 0,
        }
    }

    /// Index of the next element still expected.
    pub fn next_index(&self) -> usize {
        self.next
    }

    /// Name of the next element still expected, if any.
    pub fn pending_name(&self) -> Option<&str> {
        self.names.get(self.next).map(String::as_str)
    }

    /// Name of the element at `index`.
    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Every element has been reached. An empty pattern is complete from the start.
    pub fn is_complete(&self) -> bool {
        self.next == self.names.len()
    }

    pub fn matched_count(&self) -> usize {
        self.next
    }

    pub fn pattern_len(&self) -> usize {
        self.names.len()
    }

    pub fn lines_observed(&self) -> u64 {
        self.lines_observed
    }

    /// Whether every element with this name has been reached.
    ///
    /// Names repeat when the same line is expected more than once; use
    /// [`MatchState::reached`] to ask about one occurrence.
    pub fn is_reached(&self, name: &str) -> bool {
        let mut named = self
            .names
            .iter()
            .zip(&self.reached)
            .filter(|(n, _)| *n == name)
            .peekable();
        named.peek().is_some() && named.all(|(_, r)| r.is_some())
    }

    pub fn reached(&self, index: usize) -> Option<&MatchedEvent> {
        self.reached.get(index).and_then(Option::as_ref)
    }

    /// Per-element flags, in pattern order.
    pub fn flags(&self) -> Vec<bool> {
        self.reached.iter().map(Option::is_some).collect()
    }

    /// Reached elements, in pattern order.
    pub fn events(&self) -> impl Iterator<Item = &MatchedEvent> {
        self.reached.iter().flatten()
    }
}

/// Drives a [`MatchState`] from observed lines.
#[derive(Debug, Clone)]
pub struct EventMatcher {
    pattern: EventPattern,
    state: MatchState,
}

impl EventMatcher {
    pub fn new(pattern: EventPattern) -> Self {
        let state = MatchState::for_pattern(&pattern);
        Self { pattern, state }
    }

    pub fn pattern(&self) -> &EventPattern {
        &self.pattern
    }

    pub fn state(&self) -> &MatchState {
        &self.state
    }

    pub fn into_state(self) -> MatchState {
        self.state
    }

    /// Copy of the current progress, for reporting while still observing.
    pub fn snapshot(&self) -> MatchState {
        self.state.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    /// Feed one line. Returns the element it completed, if any.
    ///
    /// A single line advances the pattern by at most one element.
    /// Lines fed after completion are not counted.
    pub fn observe(&mut self, line: &str) -> Option<&MatchedEvent> {
        if self.state.is_complete() {
            return None;
        }
        self.state.lines_observed += 1;

        let index = self.state.next;
        let element = self.pattern.get(index)?;
        if !element.predicate.matches(line) {
            debug!(line, expecting = %element.name, "Ignoring line");
            return None;
        }

        info!(
            event = %element.name,
            index,
            line_number = self.state.lines_observed,
            "Pattern element reached"
        );
        self.state.reached[index] = Some(MatchedEvent {
            index,
            name: element.name.clone(),
            line: line.to_string(),
            line_number: self.state.lines_observed,
            reached_at: Utc::now(),
        });
        self.state.next += 1;
        self.state.reached[index].as_ref()
    }

    /// Feed lines until the pattern completes. Returns how many were consumed.
    pub fn observe_all<'a, I>(&mut self, lines: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut consumed = 0;
        for line in lines {
            if self.is_complete() {
                break;
            }
            self.observe(line);
            consumed += 1;
        }
        consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ab() -> EventMatcher {
        EventMatcher::new(EventPattern::contains_all(["A", "B"]))
    }

    #[test]
    fn test_noise_between_events_is_ignored() {
        let mut matcher = ab();

        assert!(matcher.observe("x").is_none());
        assert_eq!(matcher.state().matched_count(), 0);

        let reached = matcher.observe("A").unwrap();
        assert_eq!(reached.name, "A");
        assert_eq!(reached.line_number, 2);
        assert!(!matcher.is_complete());

        assert!(matcher.observe("y").is_none());
        assert_eq!(matcher.state().pending_name(), Some("B"));

        let reached = matcher.observe("B").unwrap();
        assert_eq!(reached.line_number, 4);
        assert!(matcher.is_complete());
        assert_eq!(matcher.state().flags(), vec![true, true]);
    }

    #[test]
    fn test_out_of_order_never_completes() {
        let mut matcher = ab();
        matcher.observe("B");
        matcher.observe("A");

        assert!(!matcher.is_complete());
        assert!(matcher.state().is_reached("A"));
        assert!(!matcher.state().is_reached("B"));
        assert_eq!(matcher.state().reached(0).unwrap().line_number, 2);
    }

    #[test]
    fn test_complete_state_ignores_further_lines() {
        let mut matcher = ab();
        matcher.observe_all(["A", "B"]);
        let before = matcher.snapshot();

        assert!(matcher.observe("A").is_none());
        assert!(matcher.observe("B").is_none());
        assert_eq!(matcher.state().flags(), before.flags());
        assert_eq!(matcher.state().lines_observed(), 2);
        assert_eq!(matcher.state().reached(1).unwrap().line_number, 2);
    }

    #[test]
    fn test_repeated_name_needs_every_occurrence() {
        let mut matcher = EventMatcher::new(EventPattern::contains_all(["A", "A", "B"]));

        matcher.observe("A");
        assert!(matcher.state().reached(0).is_some());
        assert!(matcher.state().reached(1).is_none());
        assert!(!matcher.state().is_reached("A"));

        matcher.observe("A");
        assert!(matcher.state().is_reached("A"));
        assert!(!matcher.state().is_reached("B"));
        assert!(!matcher.state().is_reached("C"));
        assert_eq!(matcher.state().flags(), vec![true, true, false]);
    }

    #[test]
    fn test_one_line_advances_one_element() {
        let mut matcher = ab();
        matcher.observe("A and B on the same line");
        assert_eq!(matcher.state().matched_count(), 1);
        assert!(!matcher.is_complete());
    }

    #[test]
    fn test_created_then_removed_scenario() {
        let mut matcher = EventMatcher::new(
            EventPattern::new()
                .then("created", Predicate::contains("Unit created (reason: real)"))
                .then("removed", Predicate::contains("Unit removed (reason: real)")),
        );

        matcher.observe("Monitor path: node-foo simple.service");
        assert!(!matcher.state().is_reached("created"));
        matcher.observe("Unit removed (reason: real)");
        assert!(!matcher.state().is_reached("removed"));
        matcher.observe("Unit created (reason: real)");
        assert!(matcher.state().is_reached("created"));
        assert!(!matcher.state().is_reached("removed"));
        matcher.observe("Unit removed (reason: real)");
        assert!(matcher.is_complete());

        let events: Vec<_> = matcher.state().events().collect();
        assert!(events[0].reached_at <= events[1].reached_at);
        assert!(events[0].line_number < events[1].line_number);
    }

    #[test]
    fn test_observe_all_stops_at_completion() {
        let mut matcher = ab();
        let consumed = matcher.observe_all(["x", "A", "B", "tail", "more"]);
        assert_eq!(consumed, 3);
        assert_eq!(matcher.state().lines_observed(), 3);
    }

    #[test]
    fn test_empty_pattern_is_complete() {
        let matcher = EventMatcher::new(EventPattern::new());
        assert!(matcher.is_complete());
        assert_eq!(matcher.state().pending_name(), None);
    }

    #[test]
    fn test_predicates() {
        assert!(Predicate::contains("node").matches("node-foo offline"));
        assert!(Predicate::exact("online").matches("online"));
        assert!(!Predicate::exact("online").matches("online "));
        let re = Predicate::regex(r"^Agent status: (on|off)line$").unwrap();
        assert!(re.matches("Agent status: offline"));
        assert!(!re.matches("status: offline"));
        assert!(Predicate::regex("(").is_err());
    }

    #[test]
    fn test_regex_all_names_elements() {
        let pattern = EventPattern::regex_all([r"created", r"removed$"]).unwrap();
        assert_eq!(pattern.len(), 2);
        assert_eq!(pattern.get(1).unwrap().name, "removed$");
        assert_eq!(
            pattern.get(0).unwrap().predicate.to_string(),
            "regex(\"created\")"
        );
    }

    #[test]
    fn test_state_serializes() {
        let mut matcher = ab();
        matcher.observe("A");
        let json = serde_json::to_value(matcher.state()).unwrap();
        assert_eq!(json["next"], 1);
        assert_eq!(json["reached"][0]["name"], "A");
        assert!(json["reached"][1].is_null());
    }
}
