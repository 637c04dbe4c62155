//! The Restage convergence layer: one external-storage location plus the
//! worker threads that move bundles to and from it.

pub mod controller;
pub mod emailer;
pub mod reloader;
pub mod restager;
pub mod scan;

pub use controller::RestageController;
pub use emailer::{LogMailer, Mailer, SendmailMailer};

use std::path::PathBuf;
use std::time::Instant;

use bard_eid::{NamingScheme, QuotaType};
use bard_fname::Separators;

use crate::runtime::OrderedMutex;

/// Lock ranks: the daemon table first, then a controller's internal state,
/// then a status record (workers update their directory maps before
/// publishing capacity changes to the shared status).
pub(crate) const LOCK_RANK_BARD: u8 = 10;
pub(crate) const LOCK_RANK_CTL_STATE: u8 = 15;
pub(crate) const LOCK_RANK_CL_STATUS: u8 = 20;

/// State of one restage convergence layer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestageClState {
    Undefined,
    Online,
    /// Usage crossed the 25% watermark.
    Low,
    /// Usage crossed the 75% watermark.
    High,
    FullQuota,
    FullDisk,
    Error,
    Shutdown,
}

impl RestageClState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestageClState::Undefined => "undefined",
            RestageClState::Online => "online",
            RestageClState::Low => "low",
            RestageClState::High => "high",
            RestageClState::FullQuota => "full_quota",
            RestageClState::FullDisk => "full_disk",
            RestageClState::Error => "error",
            RestageClState::Shutdown => "shutdown",
        }
    }

    /// Whether the acceptance oracle may route new bundles here.
    pub fn is_good(&self) -> bool {
        matches!(self, RestageClState::Online)
    }
}

impl std::fmt::Display for RestageClState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunable parameters for one restage link.
#[derive(Debug, Clone)]
pub struct RestageParams {
    /// Top level directory to use for external storage.
    pub storage_path: PathBuf,
    /// Whether to verify the storage path is on a mounted volume.
    pub mount_point: bool,
    /// Days to keep restaged bundles before the retention sweep deletes them.
    pub days_retention: u64,
    /// Whether the sweep also deletes bundles whose expiration has passed.
    pub expire_bundles: bool,
    /// Minimum seconds of remaining lifetime applied when reloading.
    pub ttl_override: u64,
    /// Seconds between automatic reload attempts (0 = never).
    pub auto_reload_interval: u64,
    /// Maximum bytes of disk to use (0 = whatever the volume has).
    pub disk_quota: u64,
    /// Whether this instance may absorb overflow for other links.
    pub part_of_pool: bool,
    pub email_enabled: bool,
    /// Volume space below which the state goes FULL_DISK.
    pub min_disk_space_available: u64,
    /// Quota headroom below which the state goes FULL_QUOTA.
    pub min_quota_available: u64,
    /// Separators for directory and file names under this root.
    pub separators: Separators,
    /// Token-bucket shaping of restage writes in bits/sec (0 = unshaped).
    pub write_rate_bps: u64,
    pub email_from: String,
    pub email_to: Vec<String>,
}

impl Default for RestageParams {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("/dtn/restage"),
            mount_point: true,
            days_retention: 7,
            expire_bundles: false,
            ttl_override: 0,
            auto_reload_interval: 3_600,
            disk_quota: 0,
            part_of_pool: true,
            email_enabled: true,
            min_disk_space_available: 100_000_000,
            min_quota_available: 1_000_000,
            separators: Separators::default(),
            write_rate_bps: 0,
            email_from: String::new(),
            email_to: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct StatusInner {
    storage_path: PathBuf,
    validated_mount_pt: String,
    mount_point: bool,
    mount_pt_validated: bool,
    storage_path_exists: bool,

    part_of_pool: bool,
    email_enabled: bool,

    vol_total_space: u64,
    vol_space_available: u64,
    vol_block_size: u64,
    disk_space_full: bool,

    disk_quota: u64,
    disk_quota_in_use: u64,
    disk_num_files: u64,
    disk_quota_full: bool,

    days_retention: u64,
    expire_bundles: bool,
    ttl_override: u64,
    auto_reload_interval: u64,

    cl_state: RestageClState,

    /// Throttle for "link not usable" log messages.
    last_error_msg_time: Option<Instant>,
}

/// Status and capacity record for one restage link, shared between the
/// daemon and the link's controller. All access goes through the internal
/// lock.
#[derive(Debug)]
pub struct RestageClStatus {
    link_name: String,
    inner: OrderedMutex<StatusInner>,
}

impl RestageClStatus {
    pub fn new(link_name: &str, params: &RestageParams) -> Self {
        Self {
            link_name: link_name.to_string(),
            inner: OrderedMutex::new(
                "restage_cl_status",
                LOCK_RANK_CL_STATUS,
                StatusInner {
                    storage_path: params.storage_path.clone(),
                    validated_mount_pt: String::new(),
                    mount_point: params.mount_point,
                    mount_pt_validated: false,
                    storage_path_exists: false,
                    part_of_pool: params.part_of_pool,
                    email_enabled: params.email_enabled,
                    vol_total_space: 0,
                    vol_space_available: 0,
                    vol_block_size: 4096,
                    disk_space_full: false,
                    disk_quota: params.disk_quota,
                    disk_quota_in_use: 0,
                    disk_num_files: 0,
                    disk_quota_full: false,
                    days_retention: params.days_retention,
                    expire_bundles: params.expire_bundles,
                    ttl_override: params.ttl_override,
                    auto_reload_interval: params.auto_reload_interval,
                    cl_state: RestageClState::Undefined,
                    last_error_msg_time: None,
                },
            ),
        }
    }

    pub fn link_name(&self) -> &str {
        &self.link_name
    }

    pub fn storage_path(&self) -> PathBuf {
        self.inner.lock().storage_path.clone()
    }

    pub fn validated_mount_pt(&self) -> String {
        self.inner.lock().validated_mount_pt.clone()
    }

    pub fn set_validated_mount_pt(&self, path: &str) {
        self.inner.lock().validated_mount_pt = path.to_string();
    }

    pub fn mount_point(&self) -> bool {
        self.inner.lock().mount_point
    }

    pub fn mount_pt_validated(&self) -> bool {
        self.inner.lock().mount_pt_validated
    }

    pub fn set_mount_pt_validated(&self, v: bool) {
        self.inner.lock().mount_pt_validated = v;
    }

    pub fn storage_path_exists(&self) -> bool {
        self.inner.lock().storage_path_exists
    }

    pub fn set_storage_path_exists(&self, v: bool) {
        self.inner.lock().storage_path_exists = v;
    }

    pub fn part_of_pool(&self) -> bool {
        self.inner.lock().part_of_pool
    }

    pub fn email_enabled(&self) -> bool {
        self.inner.lock().email_enabled
    }

    pub fn vol_total_space(&self) -> u64 {
        self.inner.lock().vol_total_space
    }

    pub fn vol_space_available(&self) -> u64 {
        self.inner.lock().vol_space_available
    }

    pub fn set_volume_stats(&self, total: u64, available: u64, block_size: u64) {
        let mut inner = self.inner.lock();
        inner.vol_total_space = total;
        inner.vol_space_available = available;
        inner.vol_block_size = if block_size == 0 { 4096 } else { block_size };
    }

    pub fn vol_block_size(&self) -> u64 {
        self.inner.lock().vol_block_size
    }

    pub fn disk_space_full(&self) -> bool {
        self.inner.lock().disk_space_full
    }

    pub fn set_disk_space_full(&self, v: bool) {
        self.inner.lock().disk_space_full = v;
    }

    pub fn disk_quota(&self) -> u64 {
        self.inner.lock().disk_quota
    }

    pub fn disk_quota_in_use(&self) -> u64 {
        self.inner.lock().disk_quota_in_use
    }

    pub fn disk_num_files(&self) -> u64 {
        self.inner.lock().disk_num_files
    }

    pub fn disk_quota_full(&self) -> bool {
        self.inner.lock().disk_quota_full
    }

    pub fn set_disk_quota_full(&self, v: bool) {
        self.inner.lock().disk_quota_full = v;
    }

    /// Account one new restaged file.
    pub fn file_added(&self, disk_usage: u64) {
        let mut inner = self.inner.lock();
        inner.disk_quota_in_use += disk_usage;
        inner.disk_num_files += 1;
        inner.vol_space_available = inner.vol_space_available.saturating_sub(disk_usage);
    }

    /// Account one removed restaged file.
    pub fn file_removed(&self, disk_usage: u64) {
        let mut inner = self.inner.lock();
        inner.disk_quota_in_use = inner.disk_quota_in_use.saturating_sub(disk_usage);
        inner.disk_num_files = inner.disk_num_files.saturating_sub(1);
        inner.vol_space_available += disk_usage;
    }

    /// Replace the usage accounting wholesale (scan/rescan).
    pub fn set_disk_usage(&self, in_use: u64, num_files: u64) {
        let mut inner = self.inner.lock();
        inner.disk_quota_in_use = in_use;
        inner.disk_num_files = num_files;
    }

    pub fn days_retention(&self) -> u64 {
        self.inner.lock().days_retention
    }

    pub fn expire_bundles(&self) -> bool {
        self.inner.lock().expire_bundles
    }

    pub fn ttl_override(&self) -> u64 {
        self.inner.lock().ttl_override
    }

    pub fn auto_reload_interval(&self) -> u64 {
        self.inner.lock().auto_reload_interval
    }

    pub fn cl_state(&self) -> RestageClState {
        self.inner.lock().cl_state
    }

    pub fn set_cl_state(&self, state: RestageClState) {
        self.inner.lock().cl_state = state;
    }

    /// Whether an error message may be logged now; a positive answer arms a
    /// ten minute hold-off.
    pub fn may_log_error(&self) -> bool {
        let mut inner = self.inner.lock();
        let allow = inner
            .last_error_msg_time
            .map(|t| t.elapsed().as_secs() >= 600)
            .unwrap_or(true);
        if allow {
            inner.last_error_msg_time = Some(Instant::now());
        }
        allow
    }
}

/// Capability interface the daemon uses to drive a restage link.
///
/// Implemented by [`RestageController`]; kept as a trait so the daemon can
/// be exercised against scripted links in tests.
pub trait RestageClIf: Send + Sync {
    /// Queue reload events for every directory. Returns directories queued.
    fn reload_all(&self, new_expiration: u64) -> usize;

    /// Queue reload events for one quota key. Returns directories queued.
    fn reload(
        &self,
        quota_type: QuotaType,
        scheme: NamingScheme,
        nodename: &str,
        new_expiration: u64,
        new_dest_eid: Option<String>,
    ) -> usize;

    /// Queue delete events for one quota key. Returns directories queued.
    fn delete_restaged_bundles(
        &self,
        quota_type: QuotaType,
        scheme: NamingScheme,
        nodename: &str,
    ) -> usize;

    /// Queue delete events for every directory. Returns directories queued.
    fn delete_all_restaged_bundles(&self) -> usize;

    /// Pause the restager and reloader ahead of a rescan.
    fn pause_for_rescan(&self);

    /// Resume the workers after a rescan completes.
    fn resume_after_rescan(&self);

    /// Re-enumerate external storage and republish usage to the daemon.
    fn rescan(&self);

    /// Fire a best-effort notification email.
    fn send_email_notifications(&self, subject: &str, body: &str);
}
