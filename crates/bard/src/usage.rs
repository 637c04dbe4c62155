//! Per-node quota and usage records and the two-view table holding them.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use bard_eid::{NamingScheme, QuotaKey, QuotaType};

/// Quota plus usage tracking for one (quota type, scheme, node).
///
/// Only the quota fields are persisted; the accounting fields live and die
/// with the process and are rebuilt from acceptance traffic and rescans.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    // identity
    quota_type: QuotaType,
    naming_scheme: NamingScheme,
    node_number: u64,
    nodename: String,
    key: String,

    // quota elements (persisted)
    quota_in_datastore: bool,
    quota_modified: bool,
    quota_internal_bundles: u64,
    quota_internal_bytes: u64,
    quota_external_bundles: u64,
    quota_external_bytes: u64,
    quota_refuse_bundle: bool,
    quota_auto_reload: bool,
    quota_restage_link_name: String,

    // usage elements (transient)
    pub inuse_internal_bundles: u64,
    pub inuse_internal_bytes: u64,
    pub inuse_external_bundles: u64,
    pub inuse_external_bytes: u64,

    pub reserved_internal_bundles: u64,
    pub reserved_internal_bytes: u64,
    pub reserved_external_bundles: u64,
    pub reserved_external_bytes: u64,

    /// External in-use snapshot taken when a rescan starts; admission checks
    /// read these while the live values are being rebuilt.
    pub last_inuse_external_bundles: u64,
    pub last_inuse_external_bytes: u64,

    /// When the daemon last issued an auto-reload for this record.
    pub last_reload_command_time: Option<Instant>,

    // email notification state
    pub email_freq_period_start: Option<Instant>,
    pub email_sent_internal_quota_reached: bool,
    pub email_sent_external_quota_reached: bool,
}

impl UsageRecord {
    pub fn new(quota_type: QuotaType, naming_scheme: NamingScheme, nodename: &str) -> Self {
        let quota_key = QuotaKey::new(quota_type, naming_scheme, nodename);
        Self {
            quota_type,
            naming_scheme,
            node_number: quota_key.node_number(),
            nodename: nodename.to_string(),
            key: quota_key.to_key_string(),
            quota_in_datastore: false,
            quota_modified: false,
            quota_internal_bundles: 0,
            quota_internal_bytes: 0,
            quota_external_bundles: 0,
            quota_external_bytes: 0,
            quota_refuse_bundle: false,
            quota_auto_reload: false,
            quota_restage_link_name: String::new(),
            inuse_internal_bundles: 0,
            inuse_internal_bytes: 0,
            inuse_external_bundles: 0,
            inuse_external_bytes: 0,
            reserved_internal_bundles: 0,
            reserved_internal_bytes: 0,
            reserved_external_bundles: 0,
            reserved_external_bytes: 0,
            last_inuse_external_bundles: 0,
            last_inuse_external_bytes: 0,
            last_reload_command_time: None,
            email_freq_period_start: None,
            email_sent_internal_quota_reached: false,
            email_sent_external_quota_reached: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn quota_type(&self) -> QuotaType {
        self.quota_type
    }

    pub fn naming_scheme(&self) -> NamingScheme {
        self.naming_scheme
    }

    pub fn node_number(&self) -> u64 {
        self.node_number
    }

    pub fn nodename(&self) -> &str {
        &self.nodename
    }

    /// Whether a quota is actually configured. Records created purely for
    /// usage tracking (and "unlimited" quotas) report false.
    pub fn has_quota(&self) -> bool {
        self.quota_internal_bytes != 0 || self.quota_internal_bundles != 0
    }

    pub fn quota_in_datastore(&self) -> bool {
        self.quota_in_datastore
    }

    pub fn set_quota_in_datastore(&mut self, v: bool) {
        self.quota_in_datastore = v;
    }

    pub fn quota_modified(&self) -> bool {
        self.quota_modified
    }

    pub fn set_quota_modified(&mut self, v: bool) {
        self.quota_modified = v;
    }

    pub fn quota_internal_bundles(&self) -> u64 {
        self.quota_internal_bundles
    }

    pub fn set_quota_internal_bundles(&mut self, v: u64) {
        self.quota_modified = true;
        self.quota_internal_bundles = v;
    }

    pub fn quota_internal_bytes(&self) -> u64 {
        self.quota_internal_bytes
    }

    pub fn set_quota_internal_bytes(&mut self, v: u64) {
        self.quota_modified = true;
        self.quota_internal_bytes = v;
    }

    pub fn quota_external_bundles(&self) -> u64 {
        self.quota_external_bundles
    }

    pub fn set_quota_external_bundles(&mut self, v: u64) {
        self.quota_modified = true;
        self.quota_external_bundles = v;
    }

    pub fn quota_external_bytes(&self) -> u64 {
        self.quota_external_bytes
    }

    pub fn set_quota_external_bytes(&mut self, v: u64) {
        self.quota_modified = true;
        self.quota_external_bytes = v;
    }

    pub fn quota_refuse_bundle(&self) -> bool {
        self.quota_refuse_bundle
    }

    pub fn set_quota_refuse_bundle(&mut self, v: bool) {
        self.quota_modified = true;
        self.quota_refuse_bundle = v;
    }

    pub fn quota_auto_reload(&self) -> bool {
        self.quota_auto_reload
    }

    pub fn set_quota_auto_reload(&mut self, v: bool) {
        self.quota_modified = true;
        self.quota_auto_reload = v;
    }

    pub fn quota_restage_link_name(&self) -> &str {
        &self.quota_restage_link_name
    }

    pub fn set_quota_restage_link_name(&mut self, v: &str) {
        self.quota_modified = true;
        self.quota_restage_link_name = v.to_string();
    }

    pub fn clear_quota_restage_link_name(&mut self) {
        self.quota_modified = true;
        self.quota_restage_link_name.clear();
    }

    /// Clear every quota field (delete / unlimited).
    pub fn clear_quota(&mut self) {
        self.set_quota_internal_bundles(0);
        self.set_quota_internal_bytes(0);
        self.set_quota_refuse_bundle(false);
        self.clear_quota_restage_link_name();
        self.set_quota_auto_reload(false);
        self.set_quota_external_bundles(0);
        self.set_quota_external_bytes(0);
    }

    pub fn committed_internal_bundles(&self) -> u64 {
        self.inuse_internal_bundles + self.reserved_internal_bundles
    }

    pub fn committed_internal_bytes(&self) -> u64 {
        self.inuse_internal_bytes + self.reserved_internal_bytes
    }

    pub fn committed_external_bundles(&self) -> u64 {
        self.inuse_external_bundles + self.reserved_external_bundles
    }

    pub fn committed_external_bytes(&self) -> u64 {
        self.inuse_external_bytes + self.reserved_external_bytes
    }

    /// Committed external totals against the pre-rescan snapshot, used while
    /// a rescan is rebuilding the live values.
    pub fn last_committed_external_bundles(&self) -> u64 {
        self.last_inuse_external_bundles + self.reserved_external_bundles
    }

    pub fn last_committed_external_bytes(&self) -> u64 {
        self.last_inuse_external_bytes + self.reserved_external_bytes
    }

    /// Whether internal storage is over quota and by how much.
    pub fn over_quota(&self) -> Option<(u64, u64)> {
        let mut over = false;
        let mut bundles_over = 0;
        let mut bytes_over = 0;

        if self.quota_internal_bundles > 0 && self.inuse_internal_bundles > self.quota_internal_bundles
        {
            over = true;
            bundles_over = self.inuse_internal_bundles - self.quota_internal_bundles;
        }
        if self.quota_internal_bytes > 0 && self.inuse_internal_bytes > self.quota_internal_bytes {
            over = true;
            bytes_over = self.inuse_internal_bytes - self.quota_internal_bytes;
        }

        over.then_some((bundles_over, bytes_over))
    }

    /// Highest internal usage percentage across the bundle and byte quotas,
    /// using committed (in-use plus reserved) totals.
    pub fn max_committed_quota_percent(&self) -> u64 {
        if !self.has_quota() {
            return 0;
        }

        let mut max_percent = 0.0f64;
        if self.quota_internal_bundles > 0 {
            max_percent = self.committed_internal_bundles() as f64
                / self.quota_internal_bundles as f64;
        }
        if self.quota_internal_bytes > 0 {
            let bytes_percent =
                self.committed_internal_bytes() as f64 / self.quota_internal_bytes as f64;
            if bytes_percent > max_percent {
                max_percent = bytes_percent;
            }
        }
        (max_percent * 100.0) as u64
    }

    /// Start a new email frequency period when the previous one has aged
    /// out, clearing the sent flags.
    pub fn check_email_frequency_period(&mut self, freq_period_secs: u64) {
        if let Some(start) = self.email_freq_period_start {
            if start.elapsed().as_secs() >= freq_period_secs {
                self.email_freq_period_start = None;
                self.email_sent_internal_quota_reached = false;
                self.email_sent_external_quota_reached = false;
            }
        }
    }
}

/// The daemon's record table.
///
/// Two views over a single set of records: `usage` holds every record ever
/// referenced and is authoritative for accounting; `quota_keys` marks the
/// subset installed by quota commands (including "unlimited" entries) and is
/// authoritative for limits. A `BTreeMap` keeps iteration grouped by quota
/// type and scheme, which the reports rely on.
#[derive(Debug, Default)]
pub struct UsageTable {
    usage: BTreeMap<String, UsageRecord>,
    quota_keys: BTreeSet<String>,
}

impl UsageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&UsageRecord> {
        self.usage.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut UsageRecord> {
        self.usage.get_mut(key)
    }

    /// The record for a key that has a quota installed.
    pub fn get_quota(&self, key: &str) -> Option<&UsageRecord> {
        if self.quota_keys.contains(key) {
            self.usage.get(key)
        } else {
            None
        }
    }

    pub fn has_quota_entry(&self, key: &str) -> bool {
        self.quota_keys.contains(key)
    }

    /// Fetch the record for a key, creating it on first reference.
    pub fn get_or_insert(
        &mut self,
        quota_type: QuotaType,
        naming_scheme: NamingScheme,
        nodename: &str,
    ) -> &mut UsageRecord {
        let key = QuotaKey::new(quota_type, naming_scheme, nodename).to_key_string();
        self.usage
            .entry(key)
            .or_insert_with(|| UsageRecord::new(quota_type, naming_scheme, nodename))
    }

    /// Mark a key as having an installed quota.
    pub fn insert_quota_key(&mut self, key: &str) {
        self.quota_keys.insert(key.to_string());
    }

    /// Remove a key from the quota view; the record stays for accounting.
    pub fn remove_quota_key(&mut self, key: &str) -> bool {
        self.quota_keys.remove(key)
    }

    pub fn iter_usage(&self) -> impl Iterator<Item = &UsageRecord> {
        self.usage.values()
    }

    pub fn iter_usage_mut(&mut self) -> impl Iterator<Item = &mut UsageRecord> {
        self.usage.values_mut()
    }

    pub fn iter_quotas(&self) -> impl Iterator<Item = &UsageRecord> {
        self.usage
            .iter()
            .filter(|(k, _)| self.quota_keys.contains(*k))
            .map(|(_, v)| v)
    }

    pub fn quota_count(&self) -> usize {
        self.quota_keys.len()
    }

    pub fn usage_count(&self) -> usize {
        self.usage.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> UsageRecord {
        UsageRecord::new(QuotaType::Dst, NamingScheme::Ipn, "5")
    }

    #[test]
    fn committed_is_inuse_plus_reserved() {
        let mut rec = record();
        rec.inuse_internal_bundles = 3;
        rec.reserved_internal_bundles = 2;
        rec.inuse_internal_bytes = 300;
        rec.reserved_internal_bytes = 200;
        assert_eq!(rec.committed_internal_bundles(), 5);
        assert_eq!(rec.committed_internal_bytes(), 500);
    }

    #[test]
    fn has_quota_follows_internal_limits() {
        let mut rec = record();
        assert!(!rec.has_quota());
        rec.set_quota_internal_bundles(10);
        assert!(rec.has_quota());
        rec.clear_quota();
        assert!(!rec.has_quota());
        rec.set_quota_internal_bytes(1);
        assert!(rec.has_quota());
    }

    #[test]
    fn over_quota_reports_excess() {
        let mut rec = record();
        rec.set_quota_internal_bundles(10);
        rec.set_quota_internal_bytes(1_000);
        rec.inuse_internal_bundles = 14;
        rec.inuse_internal_bytes = 900;
        assert_eq!(rec.over_quota(), Some((4, 0)));

        rec.inuse_internal_bytes = 1_500;
        assert_eq!(rec.over_quota(), Some((4, 500)));

        rec.inuse_internal_bundles = 10;
        rec.inuse_internal_bytes = 1_000;
        assert_eq!(rec.over_quota(), None);
    }

    #[test]
    fn committed_percent_takes_the_max() {
        let mut rec = record();
        rec.set_quota_internal_bundles(10);
        rec.set_quota_internal_bytes(1_000);
        rec.inuse_internal_bundles = 2;
        rec.inuse_internal_bytes = 900;
        assert_eq!(rec.max_committed_quota_percent(), 90);

        rec.inuse_internal_bundles = 10;
        assert_eq!(rec.max_committed_quota_percent(), 100);
    }

    #[test]
    fn table_keeps_records_after_quota_removal() {
        let mut table = UsageTable::new();
        let rec = table.get_or_insert(QuotaType::Dst, NamingScheme::Ipn, "5");
        rec.set_quota_internal_bundles(10);
        let key = rec.key().to_string();
        table.insert_quota_key(&key);

        assert_eq!(table.quota_count(), 1);
        assert!(table.get_quota(&key).is_some());

        table.remove_quota_key(&key);
        assert_eq!(table.quota_count(), 0);
        assert!(table.get_quota(&key).is_none());
        assert!(table.get(&key).is_some(), "usage record must survive");
    }

    #[test]
    fn quota_iteration_is_grouped() {
        let mut table = UsageTable::new();
        for (qt, scheme, node) in [
            (QuotaType::Src, NamingScheme::Ipn, "7"),
            (QuotaType::Dst, NamingScheme::Ipn, "5"),
            (QuotaType::Dst, NamingScheme::Dtn, "alpha"),
            (QuotaType::Dst, NamingScheme::Ipn, "300"),
        ] {
            let rec = table.get_or_insert(qt, scheme, node);
            let key = rec.key().to_string();
            table.insert_quota_key(&key);
        }

        let order: Vec<(QuotaType, NamingScheme, String)> = table
            .iter_quotas()
            .map(|r| (r.quota_type(), r.naming_scheme(), r.nodename().to_string()))
            .collect();

        // dst before src, dtn before ipn (lexicographic), ipn nodes numeric
        // thanks to the right-justified key field
        assert_eq!(
            order,
            vec![
                (QuotaType::Dst, NamingScheme::Dtn, "alpha".to_string()),
                (QuotaType::Dst, NamingScheme::Ipn, "5".to_string()),
                (QuotaType::Dst, NamingScheme::Ipn, "300".to_string()),
                (QuotaType::Src, NamingScheme::Ipn, "7".to_string()),
            ]
        );
    }
}
