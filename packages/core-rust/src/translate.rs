//! Renders taxonomy errors into wire [`ErrorBody`] values.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::envelope::ErrorBody;
use crate::error::{
    BaseError, ErrorKind, ErrorMessage, INTERNAL_SERVER_ERROR_KEY, STATUS_INTERNAL_SERVER_ERROR,
};
use crate::i18n::{display_value, MessageCatalog};

/// Turns [`BaseError`]s into caller-facing messages in a negotiated language.
///
/// | kind              | translate = true                       |
/// |-------------------|----------------------------------------|
/// | `business`        | catalog lookup + interpolation         |
/// | `internal`        | catalog lookup + interpolation         |
/// | `expose`          | placeholder substitution on each value |
/// | `invalidArgument` | catalog lookup, then substitution      |
///
/// With `translate = false` the message is returned verbatim.
#[derive(Debug, Clone)]
pub struct ErrorTranslator {
    catalog: Arc<MessageCatalog>,
}

impl ErrorTranslator {
    #[must_use]
    pub fn new(catalog: Arc<MessageCatalog>) -> Self {
        Self { catalog }
    }

    #[must_use]
    pub fn catalog(&self) -> &MessageCatalog {
        &self.catalog
    }

    #[must_use]
    pub fn render(&self, error: &BaseError, language: &str) -> ErrorBody {
        ErrorBody {
            message: self.message(error, language),
            status: error.status(),
            kind: error.kind(),
        }
    }

    /// The opaque body reported for anything outside the taxonomy.
    #[must_use]
    pub fn render_unexpected(&self, language: &str) -> ErrorBody {
        ErrorBody {
            message: Value::String(self.catalog.translate(
                language,
                INTERNAL_SERVER_ERROR_KEY,
                &BTreeMap::new(),
            )),
            status: STATUS_INTERNAL_SERVER_ERROR,
            kind: ErrorKind::Internal,
        }
    }

    fn message(&self, error: &BaseError, language: &str) -> Value {
        let replacements = error.replacements();
        match (error.message(), error.translate()) {
            (ErrorMessage::Structured(map), false) => Value::Object(map.clone()),
            (ErrorMessage::Text(text), false) => Value::String(text.clone()),
            (ErrorMessage::Structured(map), true) => {
                Value::Object(nested_replacements(map, replacements))
            }
            (ErrorMessage::Text(text), true) => Value::String(match error.kind() {
                ErrorKind::Business | ErrorKind::Internal => {
                    self.catalog.translate(language, text, replacements)
                }
                ErrorKind::Expose => substitute(text, replacements),
                ErrorKind::InvalidArgument => {
                    let localized = self.catalog.translate(language, text, replacements);
                    substitute(&localized, replacements)
                }
            }),
        }
    }
}

/// Substitutes placeholders inside every string value of `phrase`. Non-string
/// values are kept as they are.
#[must_use]
pub fn nested_replacements(
    phrase: &Map<String, Value>,
    replacements: &BTreeMap<String, Value>,
) -> Map<String, Value> {
    phrase
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(text) => Value::String(substitute(text, replacements)),
                other => other.clone(),
            };
            (key.clone(), value)
        })
        .collect()
}

/// Replaces literal `{{key}}` occurrences with unescaped replacement values,
/// one key at a time in key order.
#[must_use]
pub fn substitute(text: &str, replacements: &BTreeMap<String, Value>) -> String {
    replacements
        .iter()
        .fold(text.to_string(), |acc, (key, value)| {
            acc.replace(&format!("{{{{{key}}}}}"), &display_value(value))
        })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::PATH_NOT_FOUND_KEY;

    fn translator() -> ErrorTranslator {
        let mut catalog = MessageCatalog::new("es");
        catalog.add_messages(
            "en",
            json!({
                "orders": {"closed": "Order {{id}} is closed"},
                "limits": {"exceeded": "Limit of {{max}} exceeded for {{field}}"}
            }),
        );
        ErrorTranslator::new(Arc::new(catalog))
    }

    #[test]
    fn untranslated_business_is_verbatim() {
        let err = BaseError::business("orders.closed", 409)
            .with_replacement("id", 7)
            .untranslated();
        let body = translator().render(&err, "en");
        assert_eq!(body.message, json!("orders.closed"));
        assert_eq!(body.status, 409);
        assert_eq!(body.kind, ErrorKind::Business);
    }

    #[test]
    fn business_is_localized() {
        let err = BaseError::business("orders.closed", 409).with_replacement("id", 7);
        let body = translator().render(&err, "en");
        assert_eq!(body.message, json!("Order 7 is closed"));
    }

    #[test]
    fn internal_uses_fallback_language() {
        let err = BaseError::path_not_found("/plus");
        let body = translator().render(&err, "de");
        assert_eq!(body.message, json!("La ruta &#x2F;plus no existe"));
        assert_eq!(body.status, 404);
        assert_eq!(err.message(), &ErrorMessage::Text(PATH_NOT_FOUND_KEY.into()));
    }

    #[test]
    fn expose_substitutes_without_lookup() {
        let mut phrase = Map::new();
        phrase.insert("code".into(), json!("orders.closed"));
        phrase.insert("detail".into(), json!("order {{id}} closed"));
        phrase.insert("retry".into(), json!(false));
        let err = BaseError::expose(phrase, 422).with_replacement("id", "A-1");

        let body = translator().render(&err, "en");
        assert_eq!(
            body.message,
            json!({"code": "orders.closed", "detail": "order A-1 closed", "retry": false})
        );
        assert_eq!(body.kind, ErrorKind::Expose);
    }

    #[test]
    fn untranslated_expose_is_returned_as_object() {
        let mut phrase = Map::new();
        phrase.insert("detail".into(), json!("{{id}}"));
        let err = BaseError::expose(phrase, 422).untranslated();
        assert_eq!(translator().render(&err, "en").message, json!({"detail": "{{id}}"}));
    }

    #[test]
    fn invalid_argument_resolves_nested_placeholders() {
        // The "field" value itself carries a placeholder left by the lookup pass.
        let err = BaseError::invalid_argument("limits.exceeded", 400)
            .with_replacement("max", 5)
            .with_replacement("field", "{{name}}")
            .with_replacement("name", "amount");
        let body = translator().render(&err, "en");
        assert_eq!(body.message, json!("Limit of 5 exceeded for amount"));
    }

    #[test]
    fn unexpected_errors_are_opaque() {
        let body = translator().render_unexpected("en");
        assert_eq!(body.message, json!("Internal server error"));
        assert_eq!(body.status, 500);
        assert_eq!(body.kind, ErrorKind::Internal);
    }

    #[test]
    fn violations_render_with_label() {
        let err: BaseError = crate::schema::ObjectSchema::new()
            .field("number1", crate::schema::FieldRule::number().required())
            .validate(&json!({}))
            .unwrap_err()
            .into();
        let body = translator().render(&err, "en");
        assert_eq!(body.message, json!("\"number1\" is required"));
        assert_eq!(body.status, 400);
    }
}
