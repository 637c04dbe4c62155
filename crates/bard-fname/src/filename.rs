//! Filename codec.
//!
//! A filename is the bundle's descriptor tuple joined by the field
//! separator:
//!
//! ```text
//! <src-eid> _ <dst-eid> _ <bts> _ <seq> [_ frag _ <offset> _ <len>] _ <payload-len> _ <exp-secs>
//! ```
//!
//! An EID token is `scheme-node-service` for the numeric schemes and
//! `dtn-<escaped ssp>` for `dtn`. Two bundles producing the same filename
//! are treated as the same bundle by the restager.

use bard_eid::NamingScheme;

use crate::{BundleFileDesc, FnameError, Result, Separators};

const FRAG_MARKER: &str = "frag";

/// Render the filename for a bundle descriptor.
pub fn format_filename(desc: &BundleFileDesc, sep: &Separators) -> String {
    let fs = sep.field;
    let mut out = String::with_capacity(96);

    out.push_str(&format_eid_token(
        desc.src_scheme,
        &desc.src_nodename,
        &desc.src_service,
        sep,
    ));
    out.push(fs);
    out.push_str(&format_eid_token(
        desc.dst_scheme,
        &desc.dst_nodename,
        &desc.dst_service,
        sep,
    ));

    out.push(fs);
    out.push_str(&desc.bts_secs_or_millisecs.to_string());
    out.push(fs);
    out.push_str(&desc.bts_seq_num.to_string());

    if desc.is_frag {
        out.push(fs);
        out.push_str(FRAG_MARKER);
        out.push(fs);
        out.push_str(&desc.frag_offset.to_string());
        out.push(fs);
        out.push_str(&desc.frag_length.to_string());
    }

    out.push(fs);
    out.push_str(&desc.orig_payload_length.to_string());
    out.push(fs);
    out.push_str(&desc.exp_seconds.to_string());

    out
}

/// Parse a filename back into a descriptor.
///
/// The quota type and the file-size fields are not encoded in the name;
/// the caller fills them in from the directory name and the file metadata.
pub fn parse_filename(filename: &str, sep: &Separators) -> Result<BundleFileDesc> {
    let bad = || FnameError::MalformedFilename(filename.to_string());

    let tokens: Vec<&str> = filename.split(sep.field).collect();

    // src eid, dst eid, bts, seq, payload, exp -- plus 3 for a fragment
    if tokens.len() != 6 && tokens.len() != 9 {
        return Err(bad());
    }

    let mut desc = BundleFileDesc {
        filename: filename.to_string(),
        ..Default::default()
    };

    let (scheme, nodename, node_number, service) = parse_eid_token(tokens[0], sep, &bad)?;
    desc.src_scheme = scheme;
    desc.src_nodename = nodename;
    desc.src_node_number = node_number;
    desc.src_service = service;

    let (scheme, nodename, node_number, service) = parse_eid_token(tokens[1], sep, &bad)?;
    desc.dst_scheme = scheme;
    desc.dst_nodename = nodename;
    desc.dst_node_number = node_number;
    desc.dst_service = service;

    desc.bts_secs_or_millisecs = tokens[2].parse().map_err(|_| bad())?;
    desc.bts_seq_num = tokens[3].parse().map_err(|_| bad())?;

    let mut next = 4;
    if tokens.len() == 9 {
        if tokens[next] != FRAG_MARKER {
            return Err(bad());
        }
        desc.is_frag = true;
        desc.frag_offset = tokens[next + 1].parse().map_err(|_| bad())?;
        desc.frag_length = tokens[next + 2].parse().map_err(|_| bad())?;
        next += 3;
    }

    desc.orig_payload_length = tokens[next].parse().map_err(|_| bad())?;
    desc.exp_seconds = tokens[next + 1].parse().map_err(|_| bad())?;

    desc.payload_length = if desc.is_frag {
        desc.frag_length
    } else {
        desc.orig_payload_length
    };

    Ok(desc)
}

fn format_eid_token(
    scheme: NamingScheme,
    nodename: &str,
    service: &str,
    sep: &Separators,
) -> String {
    let es = sep.eid;
    match scheme {
        NamingScheme::Dtn => format!("dtn{es}{}", sep.escape(nodename)),
        _ => format!("{}{es}{nodename}{es}{service}", scheme.as_str()),
    }
}

fn parse_eid_token(
    token: &str,
    sep: &Separators,
    bad: &dyn Fn() -> FnameError,
) -> Result<(NamingScheme, String, u64, String)> {
    let parts: Vec<&str> = token.split(sep.eid).collect();

    let scheme: NamingScheme = parts[0].parse().map_err(|_| bad())?;

    match scheme {
        NamingScheme::Dtn => {
            if parts.len() != 2 {
                return Err(bad());
            }
            let nodename = sep.unescape(parts[1]).ok_or_else(bad)?;
            if nodename.is_empty() {
                return Err(bad());
            }
            Ok((scheme, nodename, 0, String::new()))
        }
        _ => {
            if parts.len() != 3 {
                return Err(bad());
            }
            let node_number: u64 = parts[1].parse().map_err(|_| bad())?;
            parts[2].parse::<u64>().map_err(|_| bad())?;
            Ok((scheme, parts[1].to_string(), node_number, parts[2].to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bard_eid::QuotaType;

    fn sample_desc() -> BundleFileDesc {
        BundleFileDesc {
            quota_type: QuotaType::Dst,
            src_scheme: NamingScheme::Ipn,
            src_nodename: "977".into(),
            src_node_number: 977,
            src_service: "12".into(),
            dst_scheme: NamingScheme::Dtn,
            dst_nodename: "//alpha.example/mail".into(),
            dst_node_number: 0,
            dst_service: String::new(),
            bts_secs_or_millisecs: 745_286_400_123,
            bts_seq_num: 42,
            is_frag: false,
            frag_offset: 0,
            frag_length: 0,
            orig_payload_length: 4_000,
            payload_length: 4_000,
            exp_seconds: 745_372_800,
            ..Default::default()
        }
    }

    #[test]
    fn plain_round_trip() {
        let sep = Separators::default();
        let desc = sample_desc();
        let name = format_filename(&desc, &sep);
        assert_eq!(
            name,
            "ipn-977-12_dtn-%2F%2Falpha.example%2Fmail_745286400123_42_4000_745372800"
        );

        let parsed = parse_filename(&name, &sep).unwrap();
        assert_eq!(parsed.src_nodename, "977");
        assert_eq!(parsed.src_node_number, 977);
        assert_eq!(parsed.dst_nodename, "//alpha.example/mail");
        assert_eq!(parsed.bts_secs_or_millisecs, 745_286_400_123);
        assert_eq!(parsed.bts_seq_num, 42);
        assert!(!parsed.is_frag);
        assert_eq!(parsed.payload_length, 4_000);
        assert_eq!(parsed.exp_seconds, 745_372_800);
        assert_eq!(format_filename(&parsed, &sep), name);
    }

    #[test]
    fn fragment_round_trip() {
        let sep = Separators::default();
        let mut desc = sample_desc();
        desc.is_frag = true;
        desc.frag_offset = 1_000;
        desc.frag_length = 2_000;
        desc.payload_length = 2_000;

        let name = format_filename(&desc, &sep);
        assert!(name.contains("_frag_1000_2000_"));

        let parsed = parse_filename(&name, &sep).unwrap();
        assert!(parsed.is_frag);
        assert_eq!(parsed.frag_offset, 1_000);
        assert_eq!(parsed.frag_length, 2_000);
        assert_eq!(parsed.payload_length, 2_000);
        assert_eq!(parsed.orig_payload_length, 4_000);
        assert_eq!(format_filename(&parsed, &sep), name);
    }

    #[test]
    fn alternate_separators() {
        let sep = Separators::new('.', ':').unwrap();
        let desc = sample_desc();
        let name = format_filename(&desc, &sep);
        let parsed = parse_filename(&name, &sep).unwrap();
        assert_eq!(format_filename(&parsed, &sep), name);
    }

    #[test]
    fn rejects_malformed_names() {
        let sep = Separators::default();
        assert!(parse_filename("", &sep).is_err());
        assert!(parse_filename("not_a_bundle", &sep).is_err());
        assert!(parse_filename("ipn-1-1_ipn-2-2_x_0_10_20", &sep).is_err());
        assert!(
            parse_filename("ipn-1-1_ipn-2-2_5_0_notfrag_1_2_10_20", &sep).is_err()
        );
    }
}
