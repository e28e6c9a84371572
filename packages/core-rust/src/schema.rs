//! Object schemas for envelope and payload validation.
//!
//! Validation is fail-fast: fields are checked in declaration order and the
//! first [`Violation`] is returned. Schemas compose with [`ObjectSchema::concat`],
//! merging field rules left to right.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde_json::{Map, Value};

/// Label used when the validated value itself is the offender.
const ROOT_LABEL: &str = "value";

/// Accepted shape of a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum Kind {
    /// Any JSON value, including `null`.
    Any,
    String,
    /// Any JSON number.
    Number,
    /// A JSON number without a fractional part.
    Integer,
    Boolean,
    /// A string holding an IPv4/IPv6 address, optionally with a CIDR suffix.
    Ip,
    /// An array, optionally constraining every item.
    Array(Option<Box<Kind>>),
    /// A nested object validated against its own schema.
    Object(ObjectSchema),
}

impl Kind {
    fn expected(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::String | Self::Ip => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
        }
    }
}

/// A field definition: its kind and whether it must be present.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRule {
    kind: Kind,
    required: bool,
}

impl FieldRule {
    #[must_use]
    pub fn of(kind: Kind) -> Self {
        Self {
            kind,
            required: false,
        }
    }

    #[must_use]
    pub fn any() -> Self {
        Self::of(Kind::Any)
    }

    #[must_use]
    pub fn string() -> Self {
        Self::of(Kind::String)
    }

    #[must_use]
    pub fn number() -> Self {
        Self::of(Kind::Number)
    }

    #[must_use]
    pub fn integer() -> Self {
        Self::of(Kind::Integer)
    }

    #[must_use]
    pub fn boolean() -> Self {
        Self::of(Kind::Boolean)
    }

    #[must_use]
    pub fn ip() -> Self {
        Self::of(Kind::Ip)
    }

    #[must_use]
    pub fn array() -> Self {
        Self::of(Kind::Array(None))
    }

    /// An array whose items must all satisfy `item`'s kind.
    #[must_use]
    pub fn array_of(item: FieldRule) -> Self {
        Self::of(Kind::Array(Some(Box::new(item.kind))))
    }

    #[must_use]
    pub fn object(schema: ObjectSchema) -> Self {
        Self::of(Kind::Object(schema))
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    #[must_use]
    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    #[must_use]
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Later rule refines the kind; required-ness accumulates.
    fn merge(&mut self, later: &FieldRule) {
        self.kind = match (&self.kind, &later.kind) {
            (Kind::Object(earlier), Kind::Object(next)) => Kind::Object(earlier.clone().concat(next)),
            (_, next) => next.clone(),
        };
        self.required |= later.required;
    }
}

/// Policy for keys not declared in the schema.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnknownKeys {
    /// Allowed when the schema declares no fields, rejected otherwise.
    #[default]
    Inferred,
    Allow,
    Deny,
}

/// An ordered set of field rules plus object-level constraints.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectSchema {
    fields: Vec<(String, FieldRule)>,
    unknown: UnknownKeys,
    exactly_one: Vec<Vec<String>>,
}

impl ObjectSchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a field. Redeclaring a name merges into the existing rule,
    /// keeping its position.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, rule: FieldRule) -> Self {
        self.merge_field(name.into(), &rule);
        self
    }

    #[must_use]
    pub fn allow_unknown(mut self) -> Self {
        self.unknown = UnknownKeys::Allow;
        self
    }

    #[must_use]
    pub fn deny_unknown(mut self) -> Self {
        self.unknown = UnknownKeys::Deny;
        self
    }

    /// Requires exactly one of `keys` to be present.
    #[must_use]
    pub fn exactly_one_of<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exactly_one
            .push(keys.into_iter().map(Into::into).collect());
        self
    }

    /// Merges `later` into this schema. Field rules for the same key follow
    /// last-write-wins for the kind, while a field stays required if any
    /// side requires it. New fields are appended in `later`'s order.
    #[must_use]
    pub fn concat(mut self, later: &ObjectSchema) -> Self {
        for (name, rule) in &later.fields {
            self.merge_field(name.clone(), rule);
        }
        if later.unknown != UnknownKeys::Inferred {
            self.unknown = later.unknown;
        }
        for group in &later.exactly_one {
            if !self.exactly_one.contains(group) {
                self.exactly_one.push(group.clone());
            }
        }
        self
    }

    fn merge_field(&mut self, name: String, rule: &FieldRule) {
        match self.fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, existing)) => existing.merge(rule),
            None => self.fields.push((name, rule.clone())),
        }
    }

    /// Declared fields in validation order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldRule)> {
        self.fields.iter().map(|(name, rule)| (name.as_str(), rule))
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldRule> {
        self.fields
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, rule)| rule)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn allows_unknown(&self) -> bool {
        match self.unknown {
            UnknownKeys::Inferred => self.fields.is_empty(),
            UnknownKeys::Allow => true,
            UnknownKeys::Deny => false,
        }
    }

    /// Validates a JSON value, which must be an object.
    ///
    /// # Errors
    ///
    /// Returns the first [`Violation`] encountered.
    pub fn validate(&self, value: &Value) -> Result<(), Violation> {
        let path = Path::root();
        match value {
            Value::Object(map) => self.validate_object(map, &path),
            _ => Err(Violation::new(
                ViolationCode::Type { expected: "object" },
                &path,
            )),
        }
    }

    fn validate_object(&self, map: &Map<String, Value>, path: &Path) -> Result<(), Violation> {
        for (name, rule) in &self.fields {
            let child = path.key(name);
            match map.get(name) {
                None if rule.required => {
                    return Err(Violation::new(ViolationCode::Required, &child));
                }
                None => {}
                Some(value) => check_kind(&rule.kind, value, &child)?,
            }
        }

        if !self.allows_unknown() {
            if let Some(key) = map
                .keys()
                .find(|key| self.get(key).is_none())
            {
                return Err(Violation::new(ViolationCode::Unknown, &path.key(key)));
            }
        }

        for group in &self.exactly_one {
            let present = group.iter().filter(|key| map.contains_key(*key)).count();
            if present != 1 {
                let code = if present == 0 {
                    ViolationCode::ExactlyOneMissing {
                        peers: group.clone(),
                    }
                } else {
                    ViolationCode::ExactlyOneConflict {
                        peers: group.clone(),
                    }
                };
                return Err(Violation::new(code, path));
            }
        }

        Ok(())
    }
}

fn check_kind(kind: &Kind, value: &Value, path: &Path) -> Result<(), Violation> {
    let type_error = || {
        Violation::new(
            ViolationCode::Type {
                expected: kind.expected(),
            },
            path,
        )
    };

    match kind {
        Kind::Any => Ok(()),
        Kind::String => value.is_string().then_some(()).ok_or_else(type_error),
        Kind::Number => value.is_number().then_some(()).ok_or_else(type_error),
        Kind::Integer => {
            let integral = value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|f| f.fract() == 0.0);
            integral.then_some(()).ok_or_else(type_error)
        }
        Kind::Boolean => value.is_boolean().then_some(()).ok_or_else(type_error),
        Kind::Ip => {
            let text = value.as_str().ok_or_else(type_error)?;
            if is_ip(text) {
                Ok(())
            } else {
                Err(Violation::new(ViolationCode::Ip, path))
            }
        }
        Kind::Array(item) => {
            let items = value.as_array().ok_or_else(type_error)?;
            if let Some(item) = item {
                for (index, element) in items.iter().enumerate() {
                    check_kind(item, element, &path.index(index))?;
                }
            }
            Ok(())
        }
        Kind::Object(schema) => {
            let map = value.as_object().ok_or_else(type_error)?;
            schema.validate_object(map, path)
        }
    }
}

fn is_ip(text: &str) -> bool {
    match text.split_once('/') {
        None => text.parse::<IpAddr>().is_ok(),
        Some((address, prefix)) => match (address.parse::<IpAddr>(), prefix.parse::<u8>()) {
            (Ok(IpAddr::V4(_)), Ok(bits)) => bits <= 32,
            (Ok(IpAddr::V6(_)), Ok(bits)) => bits <= 128,
            _ => false,
        },
    }
}

// ---------------------------------------------------------------------------
// Path
// ---------------------------------------------------------------------------

/// Location of a value inside the validated document.
#[derive(Debug, Clone)]
struct Path {
    label: String,
    key: String,
}

impl Path {
    fn root() -> Self {
        Self {
            label: String::new(),
            key: String::new(),
        }
    }

    fn key(&self, name: &str) -> Self {
        let label = if self.label.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.label)
        };
        Self {
            label,
            key: name.to_string(),
        }
    }

    fn index(&self, index: usize) -> Self {
        Self {
            label: format!("{}[{index}]", self.label),
            key: index.to_string(),
        }
    }

    fn label(&self) -> &str {
        if self.label.is_empty() {
            ROOT_LABEL
        } else {
            &self.label
        }
    }
}

// ---------------------------------------------------------------------------
// Violation
// ---------------------------------------------------------------------------

/// Why a value was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationCode {
    Required,
    Type { expected: &'static str },
    Ip,
    Unknown,
    ExactlyOneMissing { peers: Vec<String> },
    ExactlyOneConflict { peers: Vec<String> },
}

/// The first rule a value broke, with the path used in messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub code: ViolationCode,
    /// Dotted path to the offending value, e.g. `meta.serviceId`.
    pub label: String,
    /// Last path segment.
    pub key: String,
}

impl Violation {
    fn new(code: ViolationCode, path: &Path) -> Self {
        Self {
            code,
            label: path.label().to_string(),
            key: path.key.clone(),
        }
    }

    /// Catalog key of the localized message for this violation.
    #[must_use]
    pub fn message_key(&self) -> &'static str {
        match self.code {
            ViolationCode::Required => "validation.required",
            ViolationCode::Type { .. } => "validation.type",
            ViolationCode::Ip => "validation.ip",
            ViolationCode::Unknown => "validation.unknown",
            ViolationCode::ExactlyOneMissing { .. } => "validation.exactlyOneMissing",
            ViolationCode::ExactlyOneConflict { .. } => "validation.exactlyOneConflict",
        }
    }

    /// Interpolation values for the message template.
    #[must_use]
    pub fn context(&self) -> BTreeMap<String, Value> {
        let mut context = BTreeMap::new();
        context.insert("label".to_string(), Value::String(self.label.clone()));
        context.insert("key".to_string(), Value::String(self.key.clone()));
        match &self.code {
            ViolationCode::Type { expected } => {
                context.insert("expected".to_string(), Value::String((*expected).to_string()));
            }
            ViolationCode::ExactlyOneMissing { peers } | ViolationCode::ExactlyOneConflict { peers } => {
                context.insert("peers".to_string(), Value::String(peers.join(", ")));
            }
            ViolationCode::Required | ViolationCode::Ip | ViolationCode::Unknown => {}
        }
        context
    }
}
