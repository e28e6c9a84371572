//! Event addressing shared by both transports.
//!
//! A raw address is either a route path (`/plus`, `/billing/invoices`) served
//! over HTTP, or a three-segment broker address `scope:topic:event` where each
//! segment is a literal or the wildcard `*`. Controllers mark broker
//! subscriptions with a leading `@` (`@billing:invoices:*`); the marker is
//! optional when parsing and never part of the stored pattern.

use std::fmt;

use thiserror::Error;

/// Segment value matching any concrete segment.
pub const WILDCARD: &str = "*";

/// Separator between broker address segments.
pub const SEGMENT_SEPARATOR: char = ':';

/// Leading marker used by controllers for broker subscriptions.
pub const SUBSCRIPTION_MARKER: char = '@';

/// Leading character of every route address.
pub const ROUTE_PREFIX: char = '/';

const SEGMENT_COUNT: usize = 3;

/// Characters the HTTP router would interpret as path parameters or wildcards.
const RESERVED_ROUTE_CHARS: &[char] = &['{', '}', '*', ':', '?', '#'];

/// A raw address that could not be classified or parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed address {raw:?}: {reason}")]
pub struct MalformedAddress {
    /// The address exactly as supplied.
    pub raw: String,
    /// Why parsing failed.
    pub reason: &'static str,
}

impl MalformedAddress {
    fn new(raw: &str, reason: &'static str) -> Self {
        Self {
            raw: raw.to_string(),
            reason,
        }
    }
}

/// A parsed address, classified by its first character.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventAddress {
    /// HTTP route path, matched by exact equality.
    Route(RoutePath),
    /// Broker pattern or concrete broker address.
    Broker(BrokerAddress),
}

impl EventAddress {
    /// Parses and classifies a raw address.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedAddress`] for empty input, route paths containing
    /// router-reserved characters, and broker addresses without exactly three
    /// non-empty segments.
    pub fn parse(raw: &str) -> Result<Self, MalformedAddress> {
        if raw.is_empty() {
            return Err(MalformedAddress::new(raw, "address is empty"));
        }
        if is_route(raw) {
            RoutePath::parse(raw).map(Self::Route)
        } else {
            BrokerAddress::parse(raw).map(Self::Broker)
        }
    }

    #[must_use]
    pub fn is_route(&self) -> bool {
        matches!(self, Self::Route(_))
    }

    #[must_use]
    pub fn is_broker_pattern(&self) -> bool {
        matches!(self, Self::Broker(_))
    }
}

impl fmt::Display for EventAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Route(path) => path.fmt(f),
            Self::Broker(address) => address.fmt(f),
        }
    }
}

/// Returns `true` if the raw address is route-shaped (leading `/`).
#[must_use]
pub fn is_route(raw: &str) -> bool {
    raw.starts_with(ROUTE_PREFIX)
}

/// Returns `true` if the raw address is broker-shaped (non-empty, no leading `/`).
#[must_use]
pub fn is_broker_pattern(raw: &str) -> bool {
    !raw.is_empty() && !is_route(raw)
}

/// Tests a raw pattern against a raw concrete address.
///
/// Both sides must split into exactly three segments; each pattern segment
/// must be `*` or equal to the concrete segment at the same position.
/// A leading subscription marker on the pattern is ignored.
#[must_use]
pub fn matches(pattern: &str, concrete: &str) -> bool {
    let pattern = pattern
        .strip_prefix(SUBSCRIPTION_MARKER)
        .unwrap_or(pattern);
    let left: Vec<&str> = pattern.split(SEGMENT_SEPARATOR).collect();
    let right: Vec<&str> = concrete.split(SEGMENT_SEPARATOR).collect();

    left.len() == SEGMENT_COUNT
        && right.len() == SEGMENT_COUNT
        && left
            .iter()
            .zip(&right)
            .all(|(p, c)| segment_matches(p, c))
}

/// Tests a single pattern segment against a concrete segment.
#[must_use]
pub fn segment_matches(pattern: &str, concrete: &str) -> bool {
    pattern == WILDCARD || pattern == concrete
}

// ---------------------------------------------------------------------------
// RoutePath
// ---------------------------------------------------------------------------

/// An HTTP route path such as `/plus`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutePath(String);

impl RoutePath {
    /// Parses a route path.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedAddress`] if the path does not start with `/`,
    /// contains whitespace, or contains a router-reserved character.
    pub fn parse(raw: &str) -> Result<Self, MalformedAddress> {
        if !is_route(raw) {
            return Err(MalformedAddress::new(raw, "route must start with '/'"));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(MalformedAddress::new(raw, "route contains whitespace"));
        }
        if raw.contains(RESERVED_ROUTE_CHARS) {
            return Err(MalformedAddress::new(
                raw,
                "route contains a reserved character",
            ));
        }
        if raw.contains("//") {
            return Err(MalformedAddress::new(raw, "route has an empty segment"));
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments after the leading `/`, empty segments skipped.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(ROUTE_PREFIX).filter(|s| !s.is_empty())
    }
}

impl fmt::Display for RoutePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// BrokerAddress
// ---------------------------------------------------------------------------

/// A `scope:topic:event` triple. Any segment may be `*` when used as a
/// subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BrokerAddress {
    scope: String,
    topic: String,
    event: String,
}

impl BrokerAddress {
    /// Parses a broker address, stripping an optional leading `@`.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedAddress`] unless the input has exactly three
    /// non-empty, whitespace-free segments.
    pub fn parse(raw: &str) -> Result<Self, MalformedAddress> {
        let body = raw.strip_prefix(SUBSCRIPTION_MARKER).unwrap_or(raw);
        if is_route(body) {
            return Err(MalformedAddress::new(raw, "route path used as broker address"));
        }
        let segments: Vec<&str> = body.split(SEGMENT_SEPARATOR).collect();
        if segments.len() != SEGMENT_COUNT {
            return Err(MalformedAddress::new(
                raw,
                "broker address must have exactly 3 segments",
            ));
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(MalformedAddress::new(raw, "broker address has an empty segment"));
        }
        if body.chars().any(char::is_whitespace) {
            return Err(MalformedAddress::new(raw, "broker address contains whitespace"));
        }
        Ok(Self {
            scope: segments[0].to_string(),
            topic: segments[1].to_string(),
            event: segments[2].to_string(),
        })
    }

    /// Builds a concrete address from an inbound message's coordinates.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedAddress`] if any segment is empty, a wildcard, or
    /// contains the segment separator.
    pub fn concrete(scope: &str, topic: &str, event: &str) -> Result<Self, MalformedAddress> {
        let raw = format!("{scope}{SEGMENT_SEPARATOR}{topic}{SEGMENT_SEPARATOR}{event}");
        let address = Self::parse(&raw)?;
        if !address.is_concrete() {
            return Err(MalformedAddress::new(&raw, "concrete address contains a wildcard"));
        }
        Ok(address)
    }

    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Returns `true` if no segment is the wildcard.
    #[must_use]
    pub fn is_concrete(&self) -> bool {
        [&self.scope, &self.topic, &self.event]
            .iter()
            .all(|s| s.as_str() != WILDCARD)
    }

    /// Tests this pattern against a concrete address, segment by segment.
    #[must_use]
    pub fn matches(&self, concrete: &BrokerAddress) -> bool {
        segment_matches(&self.scope, &concrete.scope)
            && segment_matches(&self.topic, &concrete.topic)
            && segment_matches(&self.event, &concrete.event)
    }

    /// Tests only the scope and topic segments, used when routing an emitted
    /// address onto a cluster's producer topics.
    #[must_use]
    pub fn matches_destination(&self, scope: &str, topic: &str) -> bool {
        segment_matches(&self.scope, scope) && segment_matches(&self.topic, topic)
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEGMENT_SEPARATOR}{}{SEGMENT_SEPARATOR}{}",
            self.scope, self.topic, self.event
        )
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn classifies_by_first_character() {
        assert!(EventAddress::parse("/plus").unwrap().is_route());
        assert!(EventAddress::parse("q:t:e").unwrap().is_broker_pattern());
        assert!(EventAddress::parse("@q:t:*").unwrap().is_broker_pattern());
        assert!(is_route("/a/b"));
        assert!(is_broker_pattern("a:b:c"));
        assert!(!is_broker_pattern(""));
    }

    #[test]
    fn subscription_marker_is_stripped() {
        let address = BrokerAddress::parse("@billing:invoices:*").unwrap();
        assert_eq!(address.scope(), "billing");
        assert_eq!(address.topic(), "invoices");
        assert_eq!(address.event(), "*");
        assert_eq!(address.to_string(), "billing:invoices:*");
    }

    #[test]
    fn rejects_wrong_segment_count() {
        let err = EventAddress::parse("q:t").unwrap_err();
        assert_eq!(err.raw, "q:t");
        assert!(EventAddress::parse("q:t:e:x").is_err());
        assert!(EventAddress::parse("q::e").is_err());
        assert!(EventAddress::parse("").is_err());
    }

    #[test]
    fn rejects_reserved_route_characters() {
        assert!(RoutePath::parse("/users/{id}").is_err());
        assert!(RoutePath::parse("/files/*rest").is_err());
        assert!(RoutePath::parse("/a b").is_err());
        assert!(RoutePath::parse("/a//b").is_err());
        assert!(RoutePath::parse("/").is_ok());
    }

    #[test]
    fn route_segments_skip_leading_slash() {
        let path = RoutePath::parse("/billing/invoices/create").unwrap();
        let segments: Vec<_> = path.segments().collect();
        assert_eq!(segments, vec!["billing", "invoices", "create"]);
    }

    #[test]
    fn literal_and_wildcard_matching() {
        assert!(matches("q:t:e", "q:t:e"));
        assert!(!matches("q:t:e", "q:x:e"));
        assert!(matches("q:t:*", "q:t:e"));
        assert!(matches("*:*:*", "a:b:c"));
        assert!(!matches("r:t:e", "q:t:e"));
        assert!(matches("@q:*:e", "q:t:e"));
        assert!(!matches("q:t", "q:t"));
    }

    #[test]
    fn concrete_rejects_wildcards() {
        assert!(BrokerAddress::concrete("q", "t", "e").is_ok());
        assert!(BrokerAddress::concrete("q", "*", "e").is_err());
        assert!(BrokerAddress::concrete("q", "t", "a:b").is_err());
    }

    #[test]
    fn destination_matching_ignores_event() {
        let emitted = BrokerAddress::parse("q:*:created").unwrap();
        assert!(emitted.matches_destination("q", "orders"));
        assert!(!emitted.matches_destination("r", "orders"));
    }

    fn segment() -> impl Strategy<Value = String> {
        "[a-z]{1,4}"
    }

    fn pattern_segment() -> impl Strategy<Value = String> {
        prop_oneof![segment(), Just(WILDCARD.to_string())]
    }

    proptest! {
        #[test]
        fn matches_iff_every_segment_is_wildcard_or_equal(
            p in proptest::collection::vec(pattern_segment(), 3),
            c in proptest::collection::vec(segment(), 3),
        ) {
            let pattern = p.join(":");
            let concrete = c.join(":");
            let expected = p.iter().zip(&c).all(|(ps, cs)| ps == WILDCARD || ps == cs);
            prop_assert_eq!(matches(&pattern, &concrete), expected);

            let parsed_pattern = BrokerAddress::parse(&pattern).unwrap();
            let parsed_concrete = BrokerAddress::parse(&concrete).unwrap();
            prop_assert_eq!(parsed_pattern.matches(&parsed_concrete), expected);
        }

        #[test]
        fn full_wildcard_matches_everything(c in proptest::collection::vec(segment(), 3)) {
            prop_assert!(matches("*:*:*", &c.join(":")));
        }

        #[test]
        fn concrete_address_matches_itself(c in proptest::collection::vec(segment(), 3)) {
            let raw = c.join(":");
            prop_assert!(matches(&raw, &raw));
        }
    }
}
