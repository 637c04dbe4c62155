//! Endpoint identifier parsing.

use crate::{EidError, NamingScheme, Result};

/// A parsed endpoint identifier.
///
/// Only the components the restaging daemon cares about are retained: the
/// scheme, the node identifier and (for the numeric schemes) the service
/// number. The `dtn` scheme-specific part is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndpointId {
    Ipn { node: u64, service: u64 },
    Imc { group: u64, service: u64 },
    Dtn { ssp: String },
}

impl EndpointId {
    /// Parse an endpoint id URI of the form `scheme:ssp`.
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, ssp) = uri
            .split_once(':')
            .ok_or_else(|| EidError::MalformedEid(uri.to_string()))?;

        match scheme {
            "ipn" => {
                let (node, service) = parse_numeric_ssp(uri, ssp)?;
                Ok(EndpointId::Ipn { node, service })
            }
            "imc" => {
                let (group, service) = parse_numeric_ssp(uri, ssp)?;
                Ok(EndpointId::Imc { group, service })
            }
            "dtn" => {
                if ssp.is_empty() {
                    return Err(EidError::MalformedEid(uri.to_string()));
                }
                Ok(EndpointId::Dtn {
                    ssp: ssp.to_string(),
                })
            }
            other => Err(EidError::UnknownScheme(other.to_string())),
        }
    }

    pub fn scheme(&self) -> NamingScheme {
        match self {
            EndpointId::Ipn { .. } => NamingScheme::Ipn,
            EndpointId::Imc { .. } => NamingScheme::Imc,
            EndpointId::Dtn { .. } => NamingScheme::Dtn,
        }
    }

    /// The node identifier as text: the decimal node/group number for the
    /// numeric schemes, the full scheme-specific part for `dtn`.
    pub fn node_name(&self) -> String {
        match self {
            EndpointId::Ipn { node, .. } => node.to_string(),
            EndpointId::Imc { group, .. } => group.to_string(),
            EndpointId::Dtn { ssp } => ssp.clone(),
        }
    }

    /// The numeric node identifier (zero for `dtn`).
    pub fn node_number(&self) -> u64 {
        match self {
            EndpointId::Ipn { node, .. } => *node,
            EndpointId::Imc { group, .. } => *group,
            EndpointId::Dtn { .. } => 0,
        }
    }

    /// The service component as text (empty for `dtn`).
    pub fn service_name(&self) -> String {
        match self {
            EndpointId::Ipn { service, .. } | EndpointId::Imc { service, .. } => {
                service.to_string()
            }
            EndpointId::Dtn { .. } => String::new(),
        }
    }
}

fn parse_numeric_ssp(uri: &str, ssp: &str) -> Result<(u64, u64)> {
    let (node, service) = ssp
        .split_once('.')
        .ok_or_else(|| EidError::MalformedEid(uri.to_string()))?;
    let node = node
        .parse::<u64>()
        .map_err(|_| EidError::InvalidNodeNumber(node.to_string()))?;
    let service = service
        .parse::<u64>()
        .map_err(|_| EidError::MalformedEid(uri.to_string()))?;
    Ok((node, service))
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointId::Ipn { node, service } => write!(f, "ipn:{node}.{service}"),
            EndpointId::Imc { group, service } => write!(f, "imc:{group}.{service}"),
            EndpointId::Dtn { ssp } => write!(f, "dtn:{ssp}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ipn() {
        let eid = EndpointId::parse("ipn:977.12").unwrap();
        assert_eq!(
            eid,
            EndpointId::Ipn {
                node: 977,
                service: 12
            }
        );
        assert_eq!(eid.scheme(), NamingScheme::Ipn);
        assert_eq!(eid.node_name(), "977");
        assert_eq!(eid.to_string(), "ipn:977.12");
    }

    #[test]
    fn parse_imc() {
        let eid = EndpointId::parse("imc:4.1").unwrap();
        assert_eq!(eid.node_number(), 4);
        assert_eq!(eid.service_name(), "1");
    }

    #[test]
    fn parse_dtn() {
        let eid = EndpointId::parse("dtn://alpha.example/mail").unwrap();
        assert_eq!(eid.scheme(), NamingScheme::Dtn);
        assert_eq!(eid.node_name(), "//alpha.example/mail");
        assert_eq!(eid.node_number(), 0);
        assert_eq!(eid.to_string(), "dtn://alpha.example/mail");
    }

    #[test]
    fn rejects_malformed() {
        assert!(EndpointId::parse("ipn:977").is_err());
        assert!(EndpointId::parse("ipn:a.b").is_err());
        assert!(EndpointId::parse("mailto:x@y").is_err());
        assert!(EndpointId::parse("dtn:").is_err());
        assert!(EndpointId::parse("no-colon").is_err());
    }
}
