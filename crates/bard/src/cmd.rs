//! The `bard` command surface.
//!
//! Commands arrive as pre-split argument vectors (from the daemon console
//! or a startup file) and return the report or status text; errors carry a
//! human message and map to a non-zero exit status.

use std::sync::Arc;

use bard_eid::{parse_with_magnitude, NamingScheme, QuotaType};

use crate::daemon::Bard;

/// A failed command: bad arguments or a policy refusal.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("usage: {0}")]
    Usage(String),
    #[error("{0}")]
    Failed(String),
}

pub type CmdResult = std::result::Result<String, CommandError>;

const ADD_QUOTA_USAGE: &str = "bard add_quota <dst|src> <ipn|imc|dtn> <node> \
     <internal bundles> <internal bytes> \
     [<restage link> <auto reload> <external bundles> <external bytes>]";

/// Execute one `bard` subcommand.
pub fn execute(bard: &Arc<Bard>, args: &[&str]) -> CmdResult {
    let Some((&subcmd, rest)) = args.split_first() else {
        return Err(CommandError::Usage(
            "bard <add_quota|del_quota|unlimited_quota|force_restage|quotas|usage|dump|\
             rescan|reload|reload_all|del_restaged_bundles|del_all_restaged_bundles> ..."
                .to_string(),
        ));
    };

    match subcmd {
        "add_quota" => add_quota(bard, rest),
        "del_quota" => {
            let (qt, scheme, node) = key_args(rest, "bard del_quota <dst|src> <ipn|imc|dtn> <node>")?;
            bard.bardcmd_delete_quota(qt, scheme, node)
                .map_err(CommandError::Failed)?;
            Ok(format!("quota deleted for {qt} {scheme} {node}"))
        }
        "unlimited_quota" => {
            let (qt, scheme, node) =
                key_args(rest, "bard unlimited_quota <dst|src> <ipn|imc|dtn> <node>")?;
            bard.bardcmd_unlimited_quota(qt, scheme, node)
                .map_err(CommandError::Failed)?;
            Ok(format!("quota set to unlimited for {qt} {scheme} {node}"))
        }
        "force_restage" => {
            let (qt, scheme, node) =
                key_args(rest, "bard force_restage <dst|src> <ipn|imc|dtn> <node>")?;
            bard.bardcmd_force_restage(qt, scheme, node)
                .map_err(CommandError::Failed)?;
            Ok("force restage initiated".to_string())
        }
        "quotas" => Ok(bard.bardcmd_quotas(exact_flag(rest, "bard quotas [exact]")?)),
        "usage" => Ok(bard.bardcmd_usage(exact_flag(rest, "bard usage [exact]")?)),
        "dump" => {
            if !rest.is_empty() {
                return Err(CommandError::Usage("bard dump".to_string()));
            }
            Ok(bard.bardcmd_dump())
        }
        "rescan" => {
            if !rest.is_empty() {
                return Err(CommandError::Usage("bard rescan".to_string()));
            }
            bard.bardcmd_rescan().map_err(CommandError::Failed)
        }
        "reload" => reload(bard, rest),
        "reload_all" => {
            let new_expiration = match *rest {
                [] => 0,
                [exp] => number(exp)?,
                _ => {
                    return Err(CommandError::Usage(
                        "bard reload_all [<new expiration secs>]".to_string(),
                    ))
                }
            };
            bard.bardcmd_reload_all(new_expiration)
                .map_err(CommandError::Failed)
        }
        "del_restaged_bundles" => {
            let (qt, scheme, node) = key_args(
                rest,
                "bard del_restaged_bundles <dst|src> <ipn|imc|dtn> <node>",
            )?;
            bard.bardcmd_del_restaged_bundles(qt, scheme, node)
                .map_err(CommandError::Failed)
        }
        "del_all_restaged_bundles" => {
            if !rest.is_empty() {
                return Err(CommandError::Usage(
                    "bard del_all_restaged_bundles".to_string(),
                ));
            }
            bard.bardcmd_del_all_restaged_bundles()
                .map_err(CommandError::Failed)
        }
        other => Err(CommandError::Usage(format!("unknown bard subcommand: {other}"))),
    }
}

fn add_quota(bard: &Arc<Bard>, args: &[&str]) -> CmdResult {
    if args.len() != 5 && args.len() != 9 {
        return Err(CommandError::Usage(ADD_QUOTA_USAGE.to_string()));
    }

    let quota_type = quota_type(args[0])?;
    let scheme = scheme(args[1])?;
    let nodename = args[2];
    let internal_bundles = number(args[3])?;
    let internal_bytes = number(args[4])?;

    // with no restaging arguments the bundle is refused at the quota
    let (refuse, link, auto_reload, external_bundles, external_bytes) = if args.len() == 5 {
        (true, "", false, 0, 0)
    } else {
        (
            false,
            args[5],
            boolean(args[6])?,
            number(args[7])?,
            number(args[8])?,
        )
    };

    let warning = bard
        .bardcmd_add_quota(
            quota_type,
            scheme,
            nodename,
            internal_bundles,
            internal_bytes,
            refuse,
            link,
            auto_reload,
            external_bundles,
            external_bytes,
        )
        .map_err(CommandError::Failed)?;

    let mut msg = format!("quota set for {quota_type} {scheme} {nodename}");
    if !warning.is_empty() {
        msg.push('\n');
        msg.push_str(&warning);
    }
    Ok(msg)
}

fn reload(bard: &Arc<Bard>, args: &[&str]) -> CmdResult {
    const USAGE: &str =
        "bard reload <dst|src> <ipn|imc|dtn> <node> [<new expiration secs>] [<new dest EID>]";

    if args.len() < 3 || args.len() > 5 {
        return Err(CommandError::Usage(USAGE.to_string()));
    }

    let quota_type = quota_type(args[0])?;
    let scheme = scheme(args[1])?;
    let nodename = args[2];
    let new_expiration = if args.len() >= 4 { number(args[3])? } else { 0 };
    let new_dest_eid = args.get(4).map(|s| s.to_string());

    bard.bardcmd_reload(quota_type, scheme, nodename, new_expiration, new_dest_eid)
        .map_err(CommandError::Failed)
}

fn key_args<'a>(
    args: &[&'a str],
    usage: &str,
) -> std::result::Result<(QuotaType, NamingScheme, &'a str), CommandError> {
    let &[qt, sch, node] = args else {
        return Err(CommandError::Usage(usage.to_string()));
    };
    Ok((quota_type(qt)?, scheme(sch)?, node))
}

fn exact_flag(args: &[&str], usage: &str) -> std::result::Result<bool, CommandError> {
    match *args {
        [] => Ok(false),
        ["exact"] => Ok(true),
        _ => Err(CommandError::Usage(usage.to_string())),
    }
}

fn quota_type(s: &str) -> std::result::Result<QuotaType, CommandError> {
    s.parse()
        .map_err(|_| CommandError::Failed(format!("invalid quota type: {s} (valid: 'dst' or 'src')")))
}

fn scheme(s: &str) -> std::result::Result<NamingScheme, CommandError> {
    s.parse().map_err(|_| {
        CommandError::Failed(format!(
            "invalid naming scheme: {s} (valid: 'ipn', 'imc' or 'dtn')"
        ))
    })
}

fn number(s: &str) -> std::result::Result<u64, CommandError> {
    parse_with_magnitude(s).map_err(|e| CommandError::Failed(e.to_string()))
}

fn boolean(s: &str) -> std::result::Result<bool, CommandError> {
    match s.chars().next() {
        Some('t') | Some('T') | Some('1') => Ok(true),
        Some('f') | Some('F') | Some('0') => Ok(false),
        _ => Err(CommandError::Failed(format!("invalid boolean value: {s}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::PendingBundles;
    use crate::daemon::BardParams;
    use crate::store::MemStore;

    fn daemon() -> Arc<Bard> {
        Bard::new(
            BardParams::default(),
            Arc::new(MemStore::new()),
            PendingBundles::new(),
        )
    }

    #[test]
    fn add_quota_refuse_form() {
        let bard = daemon();
        let out = execute(&bard, &["add_quota", "dst", "ipn", "5", "10", "1M"]).unwrap();
        assert!(out.contains("quota set"));

        let report = execute(&bard, &["quotas", "exact"]).unwrap();
        assert!(report.contains("refuse"));
        assert!(report.contains("1000000"));
    }

    #[test]
    fn add_quota_restage_form_accepts_magnitudes() {
        let bard = daemon();
        execute(
            &bard,
            &[
                "add_quota", "src", "dtn", "alpha", "100", "10M", "restage0", "true", "1K", "2G",
            ],
        )
        .unwrap();

        let report = execute(&bard, &["quotas"]).unwrap();
        assert!(report.contains("restage0"));
        assert!(report.contains("alpha"));
        assert!(report.contains("true"));
    }

    #[test]
    fn bad_arguments_are_usage_errors() {
        let bard = daemon();
        assert!(matches!(
            execute(&bard, &["add_quota", "dst", "ipn"]),
            Err(CommandError::Usage(_))
        ));
        assert!(matches!(
            execute(&bard, &["nonsense"]),
            Err(CommandError::Usage(_))
        ));
        assert!(matches!(
            execute(&bard, &["quotas", "bogus"]),
            Err(CommandError::Usage(_))
        ));
    }

    #[test]
    fn bad_values_are_failures() {
        let bard = daemon();
        assert!(matches!(
            execute(&bard, &["add_quota", "any", "ipn", "5", "10", "1M"]),
            Err(CommandError::Failed(_))
        ));
        assert!(matches!(
            execute(&bard, &["add_quota", "dst", "ipn", "5", "10Q", "1M"]),
            Err(CommandError::Failed(_))
        ));
        assert!(matches!(
            execute(&bard, &["add_quota", "dst", "ipn", "not-a-node", "10", "1M"]),
            Err(CommandError::Failed(_))
        ));
    }

    #[test]
    fn del_quota_requires_existing_entry() {
        let bard = daemon();
        assert!(matches!(
            execute(&bard, &["del_quota", "dst", "ipn", "5"]),
            Err(CommandError::Failed(_))
        ));

        execute(&bard, &["add_quota", "dst", "ipn", "5", "10", "1M"]).unwrap();
        execute(&bard, &["del_quota", "dst", "ipn", "5"]).unwrap();

        let report = execute(&bard, &["quotas"]).unwrap();
        assert!(report.contains("No Bundle Restaging Quotas defined"));
    }

    #[test]
    fn reload_without_links_fails() {
        let bard = daemon();
        assert!(matches!(
            execute(&bard, &["reload_all"]),
            Err(CommandError::Failed(_))
        ));
        assert!(matches!(
            execute(&bard, &["del_all_restaged_bundles"]),
            Err(CommandError::Failed(_))
        ));
    }
}
