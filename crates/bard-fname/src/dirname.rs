//! Directory-name codec.
//!
//! Each (quota type, scheme, node) gets one directory under the storage
//! root: `dst_ipn_977`, `src_dtn_<escaped name>`, ...

use bard_eid::{NamingScheme, QuotaType};

use crate::{FnameError, Result, Separators};

/// Render the directory name for a quota key.
pub fn format_dir_name(
    quota_type: QuotaType,
    scheme: NamingScheme,
    nodename: &str,
    sep: &Separators,
) -> String {
    format!(
        "{}{fs}{}{fs}{}",
        quota_type.as_str(),
        scheme.as_str(),
        sep.escape(nodename),
        fs = sep.field
    )
}

/// Parse a directory name back into (quota type, scheme, nodename, node number).
pub fn parse_dir_name(
    dirname: &str,
    sep: &Separators,
) -> Result<(QuotaType, NamingScheme, String, u64)> {
    let bad = || FnameError::MalformedDirName(dirname.to_string());

    let mut parts = dirname.splitn(3, sep.field);
    let type_str = parts.next().ok_or_else(bad)?;
    let scheme_str = parts.next().ok_or_else(bad)?;
    let node_field = parts.next().ok_or_else(bad)?;

    let quota_type: QuotaType = type_str.parse().map_err(|_| bad())?;
    let scheme: NamingScheme = scheme_str.parse().map_err(|_| bad())?;

    let nodename = sep.unescape(node_field).ok_or_else(bad)?;
    if nodename.is_empty() {
        return Err(bad());
    }

    let node_number = if scheme.is_numeric() {
        scheme
            .parse_node(&nodename)
            .map_err(|_| FnameError::MalformedDirName(dirname.to_string()))?
    } else {
        0
    };

    Ok((quota_type, scheme, nodename, node_number))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipn_dir_name() {
        let sep = Separators::default();
        let name = format_dir_name(QuotaType::Dst, NamingScheme::Ipn, "977", &sep);
        assert_eq!(name, "dst_ipn_977");

        let (qt, scheme, nodename, node) = parse_dir_name(&name, &sep).unwrap();
        assert_eq!(qt, QuotaType::Dst);
        assert_eq!(scheme, NamingScheme::Ipn);
        assert_eq!(nodename, "977");
        assert_eq!(node, 977);
    }

    #[test]
    fn dtn_dir_name_escapes() {
        let sep = Separators::default();
        let name = format_dir_name(
            QuotaType::Src,
            NamingScheme::Dtn,
            "//alpha.example/mail",
            &sep,
        );
        assert!(!name[8..].contains('/'));

        let (qt, scheme, nodename, node) = parse_dir_name(&name, &sep).unwrap();
        assert_eq!(qt, QuotaType::Src);
        assert_eq!(scheme, NamingScheme::Dtn);
        assert_eq!(nodename, "//alpha.example/mail");
        assert_eq!(node, 0);
    }

    #[test]
    fn rejects_foreign_directories() {
        let sep = Separators::default();
        assert!(parse_dir_name("lost+found", &sep).is_err());
        assert!(parse_dir_name("dst_ipn_", &sep).is_err());
        assert!(parse_dir_name("dst_ipn_12x", &sep).is_err());
        assert!(parse_dir_name("any_ipn_12", &sep).is_err());
    }
}
