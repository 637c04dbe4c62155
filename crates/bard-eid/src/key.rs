//! Canonical quota/usage key strings.
//!
//! Every quota and usage record is keyed by
//! `<src|dst> '_' <ipn|dtn|imc> '_' <node field>` where the node field is a
//! 20 character column: numeric node identifiers are right justified with
//! spaces, `dtn` node names are left justified. The fixed width keeps the
//! keys sorted by node number within a (type, scheme) group, which is what
//! the reports rely on.

use crate::{EidError, EndpointId, NamingScheme, QuotaType, Result};

const NODE_FIELD_WIDTH: usize = 20;

/// The components of a canonical quota key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuotaKey {
    pub quota_type: QuotaType,
    pub scheme: NamingScheme,
    pub nodename: String,
}

impl QuotaKey {
    pub fn new(quota_type: QuotaType, scheme: NamingScheme, nodename: &str) -> Self {
        Self {
            quota_type,
            scheme,
            nodename: nodename.to_string(),
        }
    }

    /// Build the key for one side of a bundle.
    pub fn for_eid(quota_type: QuotaType, eid: &EndpointId) -> Self {
        Self {
            quota_type,
            scheme: eid.scheme(),
            nodename: eid.node_name(),
        }
    }

    /// Render the canonical key string.
    pub fn to_key_string(&self) -> String {
        if self.scheme.is_numeric() {
            format!(
                "{}_{}_{:>width$}",
                self.quota_type,
                self.scheme,
                self.nodename,
                width = NODE_FIELD_WIDTH
            )
        } else {
            format!(
                "{}_{}_{:<width$}",
                self.quota_type,
                self.scheme,
                self.nodename,
                width = NODE_FIELD_WIDTH
            )
        }
    }

    /// Parse a canonical key string back into its components.
    pub fn parse(key: &str) -> Result<Self> {
        let (type_str, rest) = key
            .split_once('_')
            .ok_or_else(|| EidError::MalformedKey(key.to_string()))?;
        let (scheme_str, node_field) = rest
            .split_once('_')
            .ok_or_else(|| EidError::MalformedKey(key.to_string()))?;

        let quota_type: QuotaType = type_str.parse()?;
        let scheme: NamingScheme = scheme_str.parse()?;

        let nodename = if scheme.is_numeric() {
            node_field.trim_start_matches(' ')
        } else {
            node_field.trim_end_matches(' ')
        };
        if nodename.is_empty() {
            return Err(EidError::MalformedKey(key.to_string()));
        }

        Ok(Self::new(quota_type, scheme, nodename))
    }

    /// The numeric node number (zero for `dtn` keys).
    pub fn node_number(&self) -> u64 {
        if self.scheme.is_numeric() {
            self.nodename.parse().unwrap_or(0)
        } else {
            0
        }
    }
}

impl std::fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_key_string())
    }
}
