//! Message catalogs, language negotiation and `{{placeholder}}` interpolation.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{json, Value};
use thiserror::Error;

use crate::value::{deep_merge, get_path};

/// Language used when negotiation finds nothing supported.
pub const DEFAULT_FALLBACK_LANGUAGE: &str = "es";

/// File read from each language directory by [`MessageCatalog::load_dir`].
pub const TRANSLATION_FILE: &str = "translation.json";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path} must contain a JSON object")]
    NotObject { path: PathBuf },
}

/// Nested message trees keyed by language tag.
#[derive(Debug, Clone)]
pub struct MessageCatalog {
    languages: HashMap<String, Value>,
    fallback: String,
    escape_values: bool,
}

impl Default for MessageCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK_LANGUAGE)
    }
}

impl MessageCatalog {
    /// A catalog holding the built-in `en` and `es` framework messages.
    #[must_use]
    pub fn new(fallback: impl Into<String>) -> Self {
        let mut languages = HashMap::new();
        languages.insert("en".to_string(), builtin_en());
        languages.insert("es".to_string(), builtin_es());
        Self {
            languages,
            fallback: fallback.into(),
            escape_values: true,
        }
    }

    /// Controls HTML-escaping of interpolated values (on by default).
    #[must_use]
    pub fn with_escape_values(mut self, escape: bool) -> Self {
        self.escape_values = escape;
        self
    }

    #[must_use]
    pub fn fallback(&self) -> &str {
        &self.fallback
    }

    /// Supported language tags, sorted.
    #[must_use]
    pub fn languages(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.languages.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Deep-merges `messages` over the catalog for `language`.
    pub fn add_messages(&mut self, language: &str, messages: Value) {
        let tree = self
            .languages
            .entry(language.to_string())
            .or_insert_with(|| json!({}));
        deep_merge(tree, messages);
    }

    /// Loads `<dir>/<lng>/translation.json` for every language directory.
    /// A missing `dir` loads nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be listed or a translation file
    /// cannot be read or is not a JSON object.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, CatalogError> {
        if !dir.is_dir() {
            tracing::debug!(dir = %dir.display(), "locales directory not found");
            return Ok(0);
        }
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| CatalogError::Io { path, source }
        };

        let mut loaded = 0;
        for entry in fs::read_dir(dir).map_err(io_err(dir))? {
            let entry = entry.map_err(io_err(dir))?;
            let file = entry.path().join(TRANSLATION_FILE);
            if !file.is_file() {
                continue;
            }
            let raw = fs::read_to_string(&file).map_err(io_err(&file))?;
            let messages: Value =
                serde_json::from_str(&raw).map_err(|source| CatalogError::Parse {
                    path: file.clone(),
                    source,
                })?;
            if !messages.is_object() {
                return Err(CatalogError::NotObject { path: file });
            }
            let language = entry.file_name().to_string_lossy().into_owned();
            tracing::debug!(%language, file = %file.display(), "loaded messages");
            self.add_messages(&language, messages);
            loaded += 1;
        }
        Ok(loaded)
    }

    fn supported(&self, tag: &str) -> Option<String> {
        let tag = tag.trim();
        if tag.is_empty() {
            return None;
        }
        if self.languages.contains_key(tag) {
            return Some(tag.to_string());
        }
        let base = base_language(tag);
        self.languages
            .contains_key(base)
            .then(|| base.to_string())
    }

    /// Picks the response language: an explicit tag (the `lng` query
    /// parameter) first, then the `Accept-Language` header by q-weight, then
    /// the fallback.
    #[must_use]
    pub fn negotiate(&self, explicit: Option<&str>, accept_language: Option<&str>) -> String {
        if let Some(language) = explicit.and_then(|tag| self.supported(tag)) {
            return language;
        }
        if let Some(header) = accept_language {
            for tag in parse_accept_language(header) {
                if tag == "*" {
                    break;
                }
                if let Some(language) = self.supported(tag) {
                    return language;
                }
            }
        }
        self.fallback.clone()
    }

    /// Finds the template for `key`: exact language, base language, then the
    /// fallback language.
    #[must_use]
    pub fn lookup(&self, language: &str, key: &str) -> Option<&str> {
        let base = base_language(language);
        [language, base, self.fallback.as_str()]
            .into_iter()
            .filter_map(|tag| self.languages.get(tag))
            .find_map(|tree| get_path(tree, key).and_then(Value::as_str))
    }

    /// Localizes `key` and interpolates `replacements`. Unknown keys are
    /// returned as-is, so literal messages pass through.
    #[must_use]
    pub fn translate(
        &self,
        language: &str,
        key: &str,
        replacements: &BTreeMap<String, Value>,
    ) -> String {
        let template = self.lookup(language, key).unwrap_or(key);
        interpolate(template, replacements, self.escape_values)
    }
}

fn base_language(tag: &str) -> &str {
    tag.split(['-', '_']).next().unwrap_or(tag)
}

/// Tags from an `Accept-Language` header, highest q-weight first.
fn parse_accept_language(header: &str) -> Vec<&str> {
    let mut weighted: Vec<(&str, f32)> = header
        .split(',')
        .filter_map(|part| {
            let mut pieces = part.split(';');
            let tag = pieces.next()?.trim();
            if tag.is_empty() {
                return None;
            }
            let quality = pieces
                .find_map(|param| param.trim().strip_prefix("q="))
                .and_then(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            (quality > 0.0).then_some((tag, quality))
        })
        .collect();
    weighted.sort_by(|a, b| b.1.total_cmp(&a.1));
    weighted.into_iter().map(|(tag, _)| tag).collect()
}

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([\w.\-]+)\s*\}\}").expect("placeholder regex should be valid")
});

/// Replaces `{{name}}` placeholders in one left-to-right pass. Names resolve
/// against the top-level keys first, then as dot paths. Unresolved
/// placeholders are kept verbatim.
#[must_use]
pub fn interpolate(template: &str, replacements: &BTreeMap<String, Value>, escape: bool) -> String {
    if replacements.is_empty() {
        return template.to_string();
    }
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            let name = &caps[1];
            let value = replacements.get(name).or_else(|| {
                let (head, rest) = name.split_once('.')?;
                get_path(replacements.get(head)?, rest)
            });
            match value {
                Some(value) => {
                    let text = display_value(value);
                    if escape {
                        escape_html(&text)
                    } else {
                        text
                    }
                }
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Plain text for a replacement value: strings unquoted, everything else as JSON.
#[must_use]
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Escapes `& < > " ' /` as HTML entities.
#[must_use]
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            '/' => out.push_str("&#x2F;"),
            other => out.push(other),
        }
    }
    out
}

fn builtin_en() -> Value {
    json!({
        "validation": {
            "required": "\"{{label}}\" is required",
            "type": "\"{{label}}\" must be of type {{expected}}",
            "ip": "\"{{label}}\" must be a valid ip address",
            "unknown": "\"{{label}}\" is not allowed",
            "exactlyOneMissing": "\"{{label}}\" must contain exactly one of [{{peers}}]",
            "exactlyOneConflict": "\"{{label}}\" contains a conflict between exclusive peers [{{peers}}]"
        },
        "generic": {
            "errors": {
                "pathNotFound": "The path {{path}} does not exist",
                "internalServerError": "Internal server error",
                "malformedBody": "The request body is not valid JSON"
            }
        }
    })
}

fn builtin_es() -> Value {
    json!({
        "validation": {
            "required": "\"{{label}}\" es requerido",
            "type": "\"{{label}}\" debe ser de tipo {{expected}}",
            "ip": "\"{{label}}\" debe ser una dirección ip válida",
            "unknown": "\"{{label}}\" no está permitido",
            "exactlyOneMissing": "\"{{label}}\" debe contener exactamente uno de [{{peers}}]",
            "exactlyOneConflict": "\"{{label}}\" contiene un conflicto entre campos exclusivos [{{peers}}]"
        },
        "generic": {
            "errors": {
                "pathNotFound": "La ruta {{path}} no existe",
                "internalServerError": "Error interno del servidor",
                "malformedBody": "El cuerpo de la solicitud no es un JSON válido"
            }
        }
    })
}
