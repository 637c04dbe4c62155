//! Text reports for the quotas/usage/dump commands.
//!
//! The reports are fixed-width tables: the node and link columns stretch to
//! the longest value present, rows are grouped by (quota type, scheme) with
//! a blank line between groups, and the non-exact variants shrink large
//! numbers with magnitude suffixes.

use bard_eid::fmt_with_mag;

use crate::daemon::BardState;
use crate::usage::UsageRecord;

/// Center `text` in a field of `width` (left-biased).
fn center(text: &str, width: usize) -> String {
    if text.len() >= width {
        return text.to_string();
    }
    let pad = width - text.len();
    let left = pad / 2;
    format!("{}{}{}", " ".repeat(left), text, " ".repeat(pad - left))
}

fn dashes(width: usize) -> String {
    "-".repeat(width)
}

/// The restage-link status block prefixed to every report.
pub(crate) fn restagecl_status_report(state: &BardState) -> String {
    let mut out = String::new();
    out.push_str("Restage Convergence Layer Status\n\n");

    if state.restagecls.is_empty() {
        out.push_str("<no active Restage Convergence Layers>\n\n\n");
        return out;
    }

    out.push_str(
        "   Link Name       State   Pooled  Reload  Mount Pnt  VolSize   Free    \
           Quota   Q Used   Q Free          Storage Path\n",
    );
    out.push_str(
        "----------------  -------  ------  ------  ---------  -------  -------  \
         -------  -------  -------  ------------------------------\n",
    );

    for cl in state.restagecls.values() {
        let status = &cl.status;

        let pooled = if status.part_of_pool() { "true" } else { "false" };
        let reload = if status.auto_reload_interval() == 0 {
            "manual"
        } else {
            "auto"
        };
        let mount_pnt = if !status.mount_point() {
            "false"
        } else if status.mount_pt_validated() {
            "validated"
        } else {
            "offline"
        };

        let quota = status.disk_quota();
        let quota_in_use = status.disk_quota_in_use();
        let quota_free = quota.saturating_sub(quota_in_use);

        out.push_str(&format!(
            "{:<16.16}  {:>7.7}  {:>6.6}  {:>6.6}  {:>9.9}  {:>7.7}  {:>7.7}  \
             {:>7.7}  {:>7.7}  {:>7.7}  {}\n",
            status.link_name(),
            status.cl_state().as_str(),
            pooled,
            reload,
            mount_pnt,
            fmt_with_mag(status.vol_total_space()),
            fmt_with_mag(status.vol_space_available()),
            fmt_with_mag(quota),
            fmt_with_mag(quota_in_use),
            fmt_with_mag(quota_free),
            status.storage_path().display(),
        ));
    }

    out.push_str("\n\n");
    out
}

fn name_and_link_widths<'a>(records: impl Iterator<Item = &'a UsageRecord>) -> (usize, usize) {
    let mut name_len = 8usize;
    let mut link_len = 10usize;
    for rec in records {
        name_len = name_len.max(rec.nodename().len());
        link_len = link_len.max(rec.quota_restage_link_name().len());
    }
    (name_len, link_len)
}

/// Per-record trailer columns: refuse-or-link, auto-reload, link state.
fn trailer_columns<'a>(
    state: &'a BardState,
    rec: &'a UsageRecord,
) -> (&'a str, &'a str, &'a str) {
    if !rec.has_quota() {
        return ("", "", "");
    }

    let auto_reload = if rec.quota_refuse_bundle() {
        ""
    } else if rec.quota_auto_reload() {
        "true"
    } else {
        "false"
    };

    let refuse_or_link = if rec.quota_refuse_bundle() {
        "refuse"
    } else {
        rec.quota_restage_link_name()
    };

    let link_state = if rec.quota_refuse_bundle() {
        ""
    } else {
        state
            .restagecls
            .get(rec.quota_restage_link_name())
            .map(|cl| cl.status.cl_state().as_str())
            .unwrap_or("offline")
    };

    (refuse_or_link, auto_reload, link_state)
}

/// Usage percentage column: the higher of the bundle-count and byte
/// percentages, annotated `#` or `B` for which quota bound it, clamped to
/// 999%.
fn quota_usage_column(
    inuse_bundles: u64,
    inuse_bytes: u64,
    quota_bundles: u64,
    quota_bytes: u64,
    has_quota: bool,
) -> String {
    if !has_quota {
        return String::new();
    }

    let mut max_percent = 0.0f64;
    let mut is_bytes = false;

    if quota_bundles > 0 {
        max_percent = inuse_bundles as f64 / quota_bundles as f64 * 100.0;
    }
    if quota_bytes > 0 {
        let bytes_percent = inuse_bytes as f64 / quota_bytes as f64 * 100.0;
        if bytes_percent > max_percent {
            max_percent = bytes_percent;
            is_bytes = true;
        }
    }

    format!(
        "{:3.0}% {}",
        max_percent.min(999.0),
        if is_bytes { "B" } else { "#" }
    )
}

/// Shared row-grouping state: a blank line between (type, scheme) groups.
struct Grouper {
    last: Option<(bard_eid::QuotaType, bard_eid::NamingScheme)>,
}

impl Grouper {
    fn new() -> Self {
        Self { last: None }
    }

    fn separator(&mut self, rec: &UsageRecord) -> &'static str {
        let group = (rec.quota_type(), rec.naming_scheme());
        let sep = match self.last {
            Some(last) if last != group => "\n",
            _ => "",
        };
        self.last = Some(group);
        sep
    }
}

pub(crate) fn quotas_report(state: &BardState, exact: bool) -> String {
    let mut out = restagecl_status_report(state);

    let num_quotas = state.table.quota_count();
    if num_quotas == 0 {
        out.push_str("No Bundle Restaging Quotas defined\n");
        return out;
    }

    let (name_len, link_len) = name_and_link_widths(state.table.iter_quotas());

    if num_quotas == 1 {
        out.push_str("Bundle Restaging Quotas (1 entry):\n\n");
    } else {
        out.push_str(&format!("Bundle Restaging Quotas ({num_quotas} entries):\n\n"));
    }

    let (int_title, col_titles, col_dashes) = if exact {
        (
            "        Internal Storage        ",
            "   Num Bundles : Payload Bytes  ",
            "  -------------:--------------- ",
        )
    } else {
        (
            " Internal Storage  ",
            " Bundles :  Bytes  ",
            " --------:-------- ",
        )
    };
    let ext_title = int_title.replace("Internal", "External");

    out.push_str(&format!(
        "Quota   Name   {}  |{}|{}|  {}   Auto     Link    \n",
        center("Node", name_len),
        int_title,
        ext_title,
        center("Refuse or", link_len),
    ));
    out.push_str(&format!(
        "Type   Scheme  {}  |{}|{}|  {}  Reload    State   \n",
        center("Name/Num", name_len),
        col_titles,
        col_titles,
        center("Link Name", link_len),
    ));
    out.push_str(&format!(
        "-----  ------  {}  |{}|{}|  {}  ------  ----------\n",
        dashes(name_len),
        col_dashes,
        col_dashes,
        dashes(link_len),
    ));

    let mut grouper = Grouper::new();
    for rec in state.table.iter_quotas() {
        out.push_str(grouper.separator(rec));

        let (refuse_or_link, auto_reload, link_state) = trailer_columns(state, rec);

        if exact {
            out.push_str(&format!(
                " {:<3}     {:<3}   {:>nl$}  |  {:>13} : {:>14} |  {:>13} : {:>14} |  \
                 {:<ll$}   {:<5}    {}\n",
                rec.quota_type().as_str(),
                rec.naming_scheme().as_str(),
                rec.nodename(),
                rec.quota_internal_bundles(),
                rec.quota_internal_bytes(),
                rec.quota_external_bundles(),
                rec.quota_external_bytes(),
                refuse_or_link,
                auto_reload,
                link_state,
                nl = name_len,
                ll = link_len,
            ));
        } else {
            out.push_str(&format!(
                " {:<3}     {:<3}   {:>nl$}  |  {:>6} : {:>6}  |  {:>6} : {:>6}  |  \
                 {:<ll$}   {:<5}    {}\n",
                rec.quota_type().as_str(),
                rec.naming_scheme().as_str(),
                rec.nodename(),
                fmt_with_mag(rec.quota_internal_bundles()),
                fmt_with_mag(rec.quota_internal_bytes()),
                fmt_with_mag(rec.quota_external_bundles()),
                fmt_with_mag(rec.quota_external_bytes()),
                refuse_or_link,
                auto_reload,
                link_state,
                nl = name_len,
                ll = link_len,
            ));
        }
    }

    if exact {
        out.push('\n');
    } else {
        out.push_str("\n(use command 'bard quotas exact' to see exact values)\n\n");
    }
    out
}

pub(crate) fn usage_report(state: &BardState, exact: bool) -> String {
    let mut out = restagecl_status_report(state);

    let num_recs = state.table.usage_count();
    if num_recs == 0 {
        out.push_str("No Bundle Restaging Quotas defined and no bundles received\n");
        return out;
    }

    let (name_len, link_len) = name_and_link_widths(state.table.iter_usage());

    if num_recs == 1 {
        out.push_str("Bundle Usage Records (1 entry):\n\n");
    } else {
        out.push_str(&format!("Bundle Usage Records ({num_recs} entries):\n\n"));
    }

    out.push_str(&format!(
        "Quota   Name   {}  |  Internal Storage  : Quota  |  External Storage  : Quota  |  \
         {}   Auto     Link    \n",
        center("Node", name_len),
        center("Refuse or", link_len),
    ));
    out.push_str(&format!(
        "Type   Scheme  {}  |  Bundles :  Bytes  : Usage  |  Bundles :  Bytes  : Usage  |  \
         {}  Reload    State   \n",
        center("Name/Num", name_len),
        center("Link Name", link_len),
    ));
    out.push_str(&format!(
        "-----  ------  {}  | --------:--------   ------ | --------:--------   ------ |  \
         {}  ------  ----------\n",
        dashes(name_len),
        dashes(link_len),
    ));

    let mut grouper = Grouper::new();
    for rec in state.table.iter_usage() {
        out.push_str(grouper.separator(rec));

        let (refuse_or_link, auto_reload, link_state) = trailer_columns(state, rec);
        let internal_usage = quota_usage_column(
            rec.inuse_internal_bundles,
            rec.inuse_internal_bytes,
            rec.quota_internal_bundles(),
            rec.quota_internal_bytes(),
            rec.has_quota(),
        );
        let external_usage = quota_usage_column(
            rec.inuse_external_bundles,
            rec.inuse_external_bytes,
            rec.quota_external_bundles(),
            rec.quota_external_bytes(),
            rec.has_quota(),
        );

        if exact {
            out.push_str(&format!(
                " {:<3}     {:<3}   {:>nl$}  | {:>12} : {:>14}   {:>6} | {:>12} : {:>14}   \
                 {:>6} |  {:<ll$}   {:<5}    {}\n",
                rec.quota_type().as_str(),
                rec.naming_scheme().as_str(),
                rec.nodename(),
                rec.inuse_internal_bundles,
                rec.inuse_internal_bytes,
                internal_usage,
                rec.inuse_external_bundles,
                rec.inuse_external_bytes,
                external_usage,
                refuse_or_link,
                auto_reload,
                link_state,
                nl = name_len,
                ll = link_len,
            ));
        } else {
            out.push_str(&format!(
                " {:<3}     {:<3}   {:>nl$}  | {:>8} : {:>8}   {:>6} | {:>8} : {:>8}   \
                 {:>6} |  {:<ll$}   {:<5}    {}\n",
                rec.quota_type().as_str(),
                rec.naming_scheme().as_str(),
                rec.nodename(),
                fmt_with_mag(rec.inuse_internal_bundles),
                fmt_with_mag(rec.inuse_internal_bytes),
                internal_usage,
                fmt_with_mag(rec.inuse_external_bundles),
                fmt_with_mag(rec.inuse_external_bytes),
                external_usage,
                refuse_or_link,
                auto_reload,
                link_state,
                nl = name_len,
                ll = link_len,
            ));
        }
    }

    out.push('\n');
    out.push_str(
        "Quota Usage: highest percentage is displayed; '#' = based on the bundle count; \
         'B' = based on the bytes quota\n",
    );
    if !exact {
        out.push_str("(use command 'bard usage exact' to see exact values)\n");
    }
    out.push('\n');
    out
}

pub(crate) fn dump_report(state: &BardState) -> String {
    let mut out = restagecl_status_report(state);

    out.push_str(&format!(
        "\nTotal bundles restaged: {}   deleted: {}\n\n",
        state.total_restaged, state.total_deleted_restaged
    ));

    let num_recs = state.table.usage_count();
    if num_recs == 0 {
        out.push_str("No Bundle Restaging Quotas defined and no bundles received\n");
        return out;
    }

    if num_recs == 1 {
        out.push_str("Bundle Usage Records (1 entry):\n\n");
    } else {
        out.push_str(&format!("Bundle Usage Records ({num_recs} entries):\n\n"));
    }

    let (name_len, _) = name_and_link_widths(state.table.iter_usage());

    out.push_str(&format!(
        "Quota   Name   {}  |     Internal Storage In Use    :   Internal Storage Reserved   |   \
           External Storage In Use    :   External Storage Reserved  \n",
        center("Node", name_len),
    ));
    out.push_str(&format!(
        "Type   Scheme  {}  |   Num Bundles : Payload Bytes  :  Num Bundles : Payload Bytes  |   \
         Num Bundles :   Disk Bytes   :  Num Bundles : Payload Bytes \n",
        center("Name/Num", name_len),
    ));
    out.push_str(&format!(
        "-----  ------  {}  |  -------------:---------------   -------------:--------------- |  \
         -------------:---------------   -------------:---------------\n",
        dashes(name_len),
    ));

    let mut grouper = Grouper::new();
    for rec in state.table.iter_usage() {
        out.push_str(grouper.separator(rec));

        out.push_str(&format!(
            " {:<3}     {:<3}   {:>nl$}  |  {:>12} : {:>14}   {:>12} : {:>14} |  {:>12} : \
             {:>14}   {:>12} : {:>14}\n",
            rec.quota_type().as_str(),
            rec.naming_scheme().as_str(),
            rec.nodename(),
            rec.inuse_internal_bundles,
            rec.inuse_internal_bytes,
            rec.reserved_internal_bundles,
            rec.reserved_internal_bytes,
            rec.inuse_external_bundles,
            rec.inuse_external_bytes,
            rec.reserved_external_bundles,
            rec.reserved_external_bytes,
            nl = name_len,
        ));
    }

    out.push('\n');
    out
}
