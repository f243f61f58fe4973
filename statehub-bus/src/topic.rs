//! Topic pattern matching.
//!
//! Topics are dot-separated segments (`component.cart.state_changed`).
//! In a pattern, a `*` segment matches one or more topic segments, so
//! `component.*` matches both `component.cart` and `component.cart.mounted`.

use crate::error::{BusError, BusResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
}

/// A compiled subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Compiles a pattern. Empty patterns and empty segments are rejected.
    pub fn parse(pattern: &str) -> BusResult<Self> {
        if pattern.is_empty() || pattern.split('.').any(str::is_empty) {
            return Err(BusError::InvalidPattern(pattern.to_string()));
        }
        let segments = pattern
            .split('.')
            .map(|s| match s {
                "*" => Segment::Wildcard,
                lit => Segment::Literal(lit.to_string()),
            })
            .collect();
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True if the pattern has no wildcard.
    pub fn is_exact(&self) -> bool {
        !self.segments.contains(&Segment::Wildcard)
    }

    pub fn matches(&self, topic: &str) -> bool {
        let parts: Vec<&str> = topic.split('.').collect();
        match_segments(&self.segments, &parts)
    }
}

fn match_segments(pattern: &[Segment], topic: &[&str]) -> bool {
    match pattern.split_first() {
        None => topic.is_empty(),
        Some((Segment::Literal(lit), rest)) => {
            topic.first().is_some_and(|t| *t == lit.as_str()) && match_segments(rest, &topic[1..])
        }
        Some((Segment::Wildcard, rest)) => {
            (1..=topic.len()).any(|n| match_segments(rest, &topic[n..]))
        }
    }
}
