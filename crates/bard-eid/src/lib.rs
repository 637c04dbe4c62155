//! Endpoint ID data types for the bundle restaging daemon.
//!
//! Three naming schemes are recognized: `ipn:<node>.<service>` and
//! `imc:<group>.<service>` (both numeric) and `dtn:<ssp>` (free-form
//! string). Quota and usage records are keyed by a canonical string built
//! from a quota type, a naming scheme and a node identifier; this crate owns
//! that key format so every other crate agrees on it.

pub mod eid;
pub mod key;
pub mod magnitude;
pub mod scheme;

pub use eid::EndpointId;
pub use key::QuotaKey;
pub use magnitude::{fmt_with_mag, parse_with_magnitude};
pub use scheme::{NamingScheme, QuotaType};

/// Error type for EID and key parsing.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EidError {
    #[error("unknown naming scheme: {0}")]
    UnknownScheme(String),
    #[error("unknown quota type: {0}")]
    UnknownQuotaType(String),
    #[error("invalid node number: {0}")]
    InvalidNodeNumber(String),
    #[error("malformed endpoint id: {0}")]
    MalformedEid(String),
    #[error("malformed quota key: {0}")]
    MalformedKey(String),
    #[error("invalid number: {0}")]
    InvalidNumber(String),
}

pub type Result<T> = std::result::Result<T, EidError>;
