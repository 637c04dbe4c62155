//! External-storage naming and file formats.
//!
//! A restaged bundle lives in a directory named after its quota key and in a
//! file whose name is a parseable descriptor of the bundle: source and
//! destination EIDs, creation timestamp and sequence number, optional
//! fragment range, payload length and expiration. The file body is a small
//! binary record carrying the same metadata plus the payload so a bundle can
//! be reconstructed from the file alone.
//!
//! Both the field separator between descriptor tokens and the EID-internal
//! separator are configurable per storage root (defaults `_` and `-`), but
//! immutable once files exist under that root.

pub mod descriptor;
pub mod dirname;
pub mod filename;
pub mod record;
pub mod sep;

pub use descriptor::BundleFileDesc;
pub use dirname::{format_dir_name, parse_dir_name};
pub use filename::{format_filename, parse_filename};
pub use record::RestageFileRecord;
pub use sep::Separators;

/// Error type for name and record codecs.
#[derive(Debug, thiserror::Error)]
pub enum FnameError {
    #[error("malformed directory name: {0}")]
    MalformedDirName(String),
    #[error("malformed filename: {0}")]
    MalformedFilename(String),
    #[error("eid error: {0}")]
    Eid(#[from] bard_eid::EidError),
    #[error("record codec error: {0}")]
    Record(#[from] binrw::Error),
    #[error("separators must be distinct printable characters")]
    BadSeparators,
}

pub type Result<T> = std::result::Result<T, FnameError>;
