//! `meshkit` Core: event addresses, envelopes, schemas, and error translation.

pub mod address;
pub mod envelope;
pub mod error;
pub mod i18n;
pub mod schema;
pub mod translate;
pub mod value;

pub use address::{BrokerAddress, EventAddress, MalformedAddress, RoutePath};
pub use envelope::{
    parse_envelope, Envelope, EnvelopeError, ErrorBody, ErrorEnvelope, Identity, Meta, MetaStamp,
    Request, WireMessage,
};
pub use error::{BaseError, ErrorKind, ErrorMessage};
pub use i18n::{CatalogError, MessageCatalog};
pub use schema::{FieldRule, Kind, ObjectSchema, Violation, ViolationCode};
pub use translate::ErrorTranslator;
