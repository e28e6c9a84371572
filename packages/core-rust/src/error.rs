//! Taxonomy errors raised by handlers and the request pipeline.
//!
//! A [`BaseError`] is built at the throw site and rendered exactly once at
//! the transport boundary by [`crate::ErrorTranslator`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::schema::Violation;

/// HTTP 400.
pub const STATUS_BAD_REQUEST: u16 = 400;
/// HTTP 404.
pub const STATUS_NOT_FOUND: u16 = 404;
/// HTTP 500.
pub const STATUS_INTERNAL_SERVER_ERROR: u16 = 500;

/// Message key rendered for unmatched routes.
pub const PATH_NOT_FOUND_KEY: &str = "generic.errors.pathNotFound";
/// Message key rendered for non-taxonomy failures.
pub const INTERNAL_SERVER_ERROR_KEY: &str = "generic.errors.internalServerError";
/// Message key rendered when a request body is not JSON.
pub const MALFORMED_BODY_KEY: &str = "generic.errors.malformedBody";

/// The four classified error kinds. Serialized as the `type` field of an
/// error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Domain rule violation, caller-facing.
    Business,
    /// Validation or framework rejection.
    Internal,
    /// Structured, pre-rendered payload.
    Expose,
    /// Parameterized message needing nested placeholder substitution.
    InvalidArgument,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Business => "business",
            Self::Internal => "internal",
            Self::Expose => "expose",
            Self::InvalidArgument => "invalidArgument",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message carried by a [`BaseError`]: a phrase (or message key) for most
/// kinds, a JSON object for `expose`.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorMessage {
    Text(String),
    Structured(Map<String, Value>),
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Structured(map) => write!(f, "{}", Value::Object(map.clone())),
        }
    }
}

/// A classified failure with its caller-facing status and rendering options.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} error ({status}): {message}")]
pub struct BaseError {
    kind: ErrorKind,
    message: ErrorMessage,
    status: u16,
    translate: bool,
    replacements: BTreeMap<String, Value>,
}

impl BaseError {
    fn text(kind: ErrorKind, phrase: impl Into<String>, status: u16) -> Self {
        Self {
            kind,
            message: ErrorMessage::Text(phrase.into()),
            status,
            translate: true,
            replacements: BTreeMap::new(),
        }
    }

    /// A domain rule violation with a caller-supplied status.
    #[must_use]
    pub fn business(phrase: impl Into<String>, status: u16) -> Self {
        Self::text(ErrorKind::Business, phrase, status)
    }

    /// A validation or framework rejection.
    #[must_use]
    pub fn internal(phrase: impl Into<String>, status: u16) -> Self {
        Self::text(ErrorKind::Internal, phrase, status)
    }

    /// A structured payload returned to the caller as-is (after placeholder
    /// substitution when translated).
    #[must_use]
    pub fn expose(phrase: Map<String, Value>, status: u16) -> Self {
        Self {
            kind: ErrorKind::Expose,
            message: ErrorMessage::Structured(phrase),
            status,
            translate: true,
            replacements: BTreeMap::new(),
        }
    }

    /// A parameterized message localized first, then placeholder-substituted.
    #[must_use]
    pub fn invalid_argument(phrase: impl Into<String>, status: u16) -> Self {
        Self::text(ErrorKind::InvalidArgument, phrase, status)
    }

    /// `internal` 404 raised for paths no controller is bound to.
    #[must_use]
    pub fn path_not_found(path: &str) -> Self {
        Self::internal(PATH_NOT_FOUND_KEY, STATUS_NOT_FOUND).with_replacement("path", path)
    }

    /// `internal` 400 raised when the request body is not JSON.
    #[must_use]
    pub fn malformed_body() -> Self {
        Self::internal(MALFORMED_BODY_KEY, STATUS_BAD_REQUEST)
    }

    /// Rebuilds an error received from another service. The message has
    /// already been rendered remotely, so it is never translated again.
    #[must_use]
    pub fn from_rendered(kind: ErrorKind, message: Value, status: u16) -> Self {
        let message = match message {
            Value::String(text) => ErrorMessage::Text(text),
            Value::Object(map) => ErrorMessage::Structured(map),
            other => ErrorMessage::Text(other.to_string()),
        };
        Self {
            kind,
            message,
            status,
            translate: false,
            replacements: BTreeMap::new(),
        }
    }

    /// Disables localization; the message is returned verbatim.
    #[must_use]
    pub fn untranslated(mut self) -> Self {
        self.translate = false;
        self
    }

    #[must_use]
    pub fn with_translate(mut self, translate: bool) -> Self {
        self.translate = translate;
        self
    }

    /// Adds one interpolation value.
    #[must_use]
    pub fn with_replacement(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.replacements.insert(key.into(), value.into());
        self
    }

    /// Adds several interpolation values; later keys overwrite earlier ones.
    #[must_use]
    pub fn with_replacements(
        mut self,
        replacements: impl IntoIterator<Item = (String, Value)>,
    ) -> Self {
        self.replacements.extend(replacements);
        self
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &ErrorMessage {
        &self.message
    }

    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    #[must_use]
    pub fn translate(&self) -> bool {
        self.translate
    }

    #[must_use]
    pub fn replacements(&self) -> &BTreeMap<String, Value> {
        &self.replacements
    }
}

/// Validation failures become translated `internal` 400s whose replacements
/// carry the violation context (label, key, ...).
impl From<Violation> for BaseError {
    fn from(violation: Violation) -> Self {
        Self::internal(violation.message_key(), STATUS_BAD_REQUEST)
            .with_replacements(violation.context())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn constructors_default_to_translated() {
        let err = BaseError::business("orders.errors.closed", 409);
        assert_eq!(err.kind(), ErrorKind::Business);
        assert_eq!(err.status(), 409);
        assert!(err.translate());
        assert!(err.replacements().is_empty());
    }

    #[test]
    fn untranslated_and_replacements() {
        let err = BaseError::invalid_argument("args.bad", 422)
            .with_replacement("field", "amount")
            .untranslated();
        assert!(!err.translate());
        assert_eq!(err.replacements()["field"], json!("amount"));
    }

    #[test]
    fn kind_serializes_as_wire_name() {
        assert_eq!(
            serde_json::to_value(ErrorKind::InvalidArgument).unwrap(),
            json!("invalidArgument")
        );
        assert_eq!(ErrorKind::Expose.to_string(), "expose");
    }

    #[test]
    fn path_not_found_carries_path() {
        let err = BaseError::path_not_found("/plus");
        assert_eq!(err.status(), STATUS_NOT_FOUND);
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.replacements()["path"], json!("/plus"));
        assert_eq!(err.message(), &ErrorMessage::Text(PATH_NOT_FOUND_KEY.into()));
    }

    #[test]
    fn from_rendered_keeps_structured_message() {
        let err = BaseError::from_rendered(ErrorKind::Expose, json!({"code": "E1"}), 422);
        assert!(!err.translate());
        assert!(matches!(err.message(), ErrorMessage::Structured(m) if m["code"] == "E1"));
    }

    #[test]
    fn display_includes_kind_and_status() {
        let err = BaseError::internal("boom", 500);
        assert_eq!(err.to_string(), "internal error (500): boom");
    }
}
