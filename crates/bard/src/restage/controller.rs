//! The external storage controller for one restage link.
//!
//! Owns the status record shared with the daemon, the on-disk directory
//! map, and the three worker threads: the controller loop (volume stats,
//! state machine, retention sweep, auto reload, rescan), the Restager and
//! the Reloader.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use log::{error, info, warn};

use bard_eid::{NamingScheme, QuotaType};
use bard_fname::{format_dir_name, BundleFileDesc, Separators};

use crate::daemon::Bard;
use crate::dtntime;
use crate::error::{BardError, Result};
use crate::link::Link;
use crate::runtime::{interruptible_sleep, OrderedMutex, StartGate, Worker};
use crate::BundleSink;

use super::emailer::{spawn_emailer, Mailer};
use super::reloader::run_reloader;
use super::restager::run_restager;
use super::scan::scan_external_storage;
use super::{RestageClIf, RestageClState, RestageClStatus, RestageParams, LOCK_RANK_CTL_STATE};

/// Per-directory statistics.
#[derive(Debug, Clone)]
pub struct DirStats {
    pub quota_type: QuotaType,
    pub scheme: NamingScheme,
    pub nodename: String,
    pub node_number: u64,
    pub num_files: u64,
    /// Block-rounded disk usage of the directory's files.
    pub total_size: u64,
}

/// Counters reported by `dump_link` and exercised heavily by the tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestageTotals {
    pub restaged: u64,
    pub dupes_ignored: u64,
    pub errors: u64,
    pub reloaded: u64,
    pub deleted: u64,
}

pub(crate) struct CtlState {
    /// dirname -> filename -> descriptor for every file under the root.
    pub restage_dirs: BTreeMap<String, BTreeMap<String, BundleFileDesc>>,
    pub dir_stats: BTreeMap<String, DirStats>,
    pub grand_total_num_files: u64,
    pub grand_total_num_bytes: u64,
    pub totals: RestageTotals,
    pub external_storage_scanned: bool,
    last_auto_reload: Instant,
    last_gc: Instant,
    last_volume_refresh: Instant,
}

/// Reload/delete work posted to the Reloader.
#[derive(Debug, Clone)]
pub(crate) enum ReloadEvent {
    Reload {
        dirname: String,
        new_expiration: u64,
        new_dest_eid: Option<String>,
    },
    Delete {
        dirname: String,
    },
}

/// One restage convergence layer instance.
pub struct RestageController {
    link_name: String,
    params: RestageParams,
    sep: Separators,
    status: Arc<RestageClStatus>,
    bard: Weak<Bard>,
    link: Arc<Link>,
    sink: Arc<dyn BundleSink>,
    mailer: Arc<dyn Mailer>,

    pub(crate) state: OrderedMutex<CtlState>,
    paused: AtomicBool,
    perform_rescan: AtomicBool,

    reload_tx: Sender<ReloadEvent>,
    pub(crate) reload_rx: Receiver<ReloadEvent>,

    workers: Mutex<Vec<Worker>>,
}

impl RestageController {
    /// Bring up a restage link: validate the storage location, scan what is
    /// already there, register with the daemon and start the workers.
    pub fn spawn(
        link_name: &str,
        params: RestageParams,
        bard: &Arc<Bard>,
        sink: Arc<dyn BundleSink>,
        mailer: Arc<dyn Mailer>,
        gate: Arc<StartGate>,
    ) -> Result<Arc<Self>> {
        let sep = params.separators;
        let status = Arc::new(RestageClStatus::new(link_name, &params));
        let link = Link::new(link_name);
        let (reload_tx, reload_rx) = crossbeam_channel::unbounded();

        let now = Instant::now();
        let ctl = Arc::new(Self {
            link_name: link_name.to_string(),
            params,
            sep,
            status: status.clone(),
            bard: Arc::downgrade(bard),
            link,
            sink,
            mailer,
            state: OrderedMutex::new(
                "restage_ctl_state",
                LOCK_RANK_CTL_STATE,
                CtlState {
                    restage_dirs: BTreeMap::new(),
                    dir_stats: BTreeMap::new(),
                    grand_total_num_files: 0,
                    grand_total_num_bytes: 0,
                    totals: RestageTotals::default(),
                    external_storage_scanned: false,
                    last_auto_reload: now,
                    last_gc: now,
                    last_volume_refresh: now,
                },
            ),
            paused: AtomicBool::new(false),
            perform_rescan: AtomicBool::new(false),
            reload_tx,
            reload_rx,
            workers: Mutex::new(Vec::new()),
        });

        match ctl.prepare_storage() {
            Ok(()) => {
                ctl.refresh_volume_stats();
                scan_external_storage(&ctl)?;
                ctl.update_cl_state();
            }
            // a missing mount leaves the link registered but unusable; any
            // other storage failure aborts the bring-up
            Err(BardError::NotAMountPoint(_)) => {}
            Err(e) => return Err(e),
        }

        bard.register_restage_cl(status, ctl.clone(), ctl.link.clone());

        let mut workers = ctl.workers.lock().unwrap();
        {
            let ctl = ctl.clone();
            workers.push(Worker::spawn(
                &format!("restage-ctl-{link_name}"),
                gate.clone(),
                move |flag| run_controller(ctl, &flag),
            ));
        }
        {
            let ctl = ctl.clone();
            workers.push(Worker::spawn(
                &format!("restager-{link_name}"),
                gate.clone(),
                move |flag| run_restager(ctl, &flag),
            ));
        }
        {
            let ctl = ctl.clone();
            workers.push(Worker::spawn(
                &format!("reloader-{link_name}"),
                gate,
                move |flag| run_reloader(ctl, &flag),
            ));
        }
        drop(workers);

        info!("restage link {link_name} up");
        Ok(ctl)
    }

    /// Stop the workers, move to SHUTDOWN and unregister from the daemon.
    pub fn shutdown(&self) {
        self.status.set_cl_state(RestageClState::Shutdown);

        let mut workers = self.workers.lock().unwrap();
        for w in workers.iter() {
            w.request_stop();
        }
        for w in workers.iter_mut() {
            w.shutdown();
        }
        workers.clear();

        if let Some(bard) = self.bard.upgrade() {
            bard.unregister_restage_cl(&self.link_name);
        }
        info!("restage link {} down", self.link_name);
    }

    pub fn link_name(&self) -> &str {
        &self.link_name
    }

    pub fn link(&self) -> Arc<Link> {
        self.link.clone()
    }

    pub fn status(&self) -> Arc<RestageClStatus> {
        self.status.clone()
    }

    pub(crate) fn params(&self) -> &RestageParams {
        &self.params
    }

    pub(crate) fn separators(&self) -> &Separators {
        &self.sep
    }

    pub(crate) fn sink(&self) -> &Arc<dyn BundleSink> {
        &self.sink
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub(crate) fn with_bard<R>(&self, f: impl FnOnce(&Arc<Bard>) -> R) -> Option<R> {
        self.bard.upgrade().map(|bard| f(&bard))
    }

    pub fn totals(&self) -> RestageTotals {
        self.state.lock().totals
    }

    /// Number of files currently tracked under the storage root.
    pub fn tracked_files(&self) -> u64 {
        self.state.lock().grand_total_num_files
    }

    pub(crate) fn dir_path(&self, dirname: &str) -> PathBuf {
        self.params.storage_path.join(dirname)
    }

    fn prepare_storage(&self) -> Result<()> {
        let path = &self.params.storage_path;

        if self.params.mount_point {
            match validate_mount_point(path) {
                Ok(mount_pt) => {
                    self.status.set_mount_pt_validated(true);
                    self.status.set_validated_mount_pt(&mount_pt);
                }
                Err(e) => {
                    self.status.set_cl_state(RestageClState::Error);
                    error!(
                        "restage link {}: storage path {} failed mount point validation: {e}",
                        self.link_name,
                        path.display()
                    );
                    return Err(e);
                }
            }
        }

        std::fs::create_dir_all(path)
            .map_err(|e| BardError::io(path.display().to_string(), e))?;
        self.status.set_storage_path_exists(true);
        Ok(())
    }

    pub(crate) fn refresh_volume_stats(&self) {
        match volume_stats(&self.params.storage_path) {
            Ok((total, available, block)) => {
                self.status.set_volume_stats(total, available, block);
            }
            Err(e) => {
                warn!(
                    "restage link {}: unable to read volume stats: {e}",
                    self.link_name
                );
            }
        }
    }

    /// Derive the link state from the capacity picture and fire the email
    /// hook on transitions out of the usable states.
    pub(crate) fn update_cl_state(&self) {
        let old_state = self.status.cl_state();
        if matches!(old_state, RestageClState::Shutdown | RestageClState::Error) {
            return;
        }

        let disk_quota = self.status.disk_quota();
        let in_use = self.status.disk_quota_in_use();
        let vol_total = self.status.vol_total_space();
        let vol_available = self.status.vol_space_available();

        let disk_full = vol_available < self.params.min_disk_space_available;
        let quota_full =
            disk_quota > 0 && in_use + self.params.min_quota_available > disk_quota;

        let new_state = if disk_full {
            RestageClState::FullDisk
        } else if quota_full {
            RestageClState::FullQuota
        } else {
            let percent = if disk_quota > 0 {
                (in_use as f64 / disk_quota as f64) * 100.0
            } else if vol_total > 0 {
                ((vol_total - vol_available) as f64 / vol_total as f64) * 100.0
            } else {
                0.0
            };

            if percent >= 75.0 {
                RestageClState::High
            } else if percent >= 25.0 {
                RestageClState::Low
            } else {
                RestageClState::Online
            }
        };

        self.status.set_disk_space_full(disk_full);
        self.status.set_disk_quota_full(quota_full);

        if new_state != old_state {
            info!(
                "restage link {}: state {} -> {}",
                self.link_name, old_state, new_state
            );
            self.status.set_cl_state(new_state);

            let alert = !matches!(
                new_state,
                RestageClState::Online | RestageClState::Low | RestageClState::High
            );
            if alert && self.status.email_enabled() {
                self.send_email_notifications(
                    &format!("restage link {} state change", self.link_name),
                    &format!(
                        "external storage {} is now in state {} \
                         (quota in use {} of {}, volume free {})",
                        self.params.storage_path.display(),
                        new_state,
                        in_use,
                        disk_quota,
                        vol_available
                    ),
                );
            }
        }
    }

    /// Move the link into ERROR after a persistent storage failure.
    pub(crate) fn enter_error_state(&self, why: &str) {
        let old_state = self.status.cl_state();
        if old_state == RestageClState::Error {
            return;
        }
        error!("restage link {}: entering error state: {why}", self.link_name);
        self.status.set_cl_state(RestageClState::Error);
        if self.status.email_enabled() {
            self.send_email_notifications(
                &format!("restage link {} error", self.link_name),
                &format!(
                    "external storage {} is unusable: {why}",
                    self.params.storage_path.display()
                ),
            );
        }
    }

    /// Remove one on-disk file's accounting after a reload, delete or sweep.
    /// Does NOT touch the daemon's usage counters; callers follow up with
    /// `restaged_bundle_deleted`.
    pub(crate) fn forget_file(&self, dirname: &str, filename: &str) -> Option<BundleFileDesc> {
        let mut state = self.state.lock();

        let desc = state
            .restage_dirs
            .get_mut(dirname)
            .and_then(|files| files.remove(filename))?;

        if let Some(stats) = state.dir_stats.get_mut(dirname) {
            stats.num_files = stats.num_files.saturating_sub(1);
            stats.total_size = stats.total_size.saturating_sub(desc.disk_usage);
        }
        state.grand_total_num_files = state.grand_total_num_files.saturating_sub(1);
        state.grand_total_num_bytes = state.grand_total_num_bytes.saturating_sub(desc.disk_usage);

        self.status.file_removed(desc.disk_usage);
        Some(desc)
    }

    /// Track one new on-disk file.
    pub(crate) fn track_file(&self, dirname: &str, desc: BundleFileDesc) {
        let mut state = self.state.lock();

        let stats = state.dir_stats.entry(dirname.to_string()).or_insert_with(|| {
            // the dirname was produced by format_dir_name, so this parses
            let (quota_type, scheme, nodename, node_number) =
                bard_fname::parse_dir_name(dirname, &self.sep).expect("own dirname parses");
            DirStats {
                quota_type,
                scheme,
                nodename,
                node_number,
                num_files: 0,
                total_size: 0,
            }
        });
        stats.num_files += 1;
        stats.total_size += desc.disk_usage;

        state.grand_total_num_files += 1;
        state.grand_total_num_bytes += desc.disk_usage;

        self.status.file_added(desc.disk_usage);

        state
            .restage_dirs
            .entry(dirname.to_string())
            .or_default()
            .insert(desc.filename.clone(), desc);
    }

    /// Delete a file on disk and drop it from the accounting, reporting the
    /// usage change to the daemon.
    pub(crate) fn delete_tracked_file(&self, dirname: &str, filename: &str) -> Option<u64> {
        let path = self.dir_path(dirname).join(filename);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("unable to delete restaged file {}: {e}", path.display());
                return None;
            }
        }

        let desc = self.forget_file(dirname, filename)?;

        self.with_bard(|bard| {
            bard.restaged_bundle_deleted(
                desc.quota_type,
                scheme_of(&desc),
                &nodename_of(&desc),
                desc.disk_usage,
            )
        });
        Some(desc.disk_usage)
    }

    /// The retention/expiry sweep.
    pub(crate) fn do_garbage_collection(&self) {
        let retention_secs = self.status.days_retention() * 86_400;
        let expire = self.status.expire_bundles();
        let now_unix = dtntime::now_unix_secs();
        let now_dtn = dtntime::now_dtn_secs();

        // collect victims without holding the lock across deletions
        let victims: Vec<(String, String)> = {
            let state = self.state.lock();
            state
                .restage_dirs
                .iter()
                .flat_map(|(dirname, files)| {
                    files
                        .values()
                        .filter(|desc| {
                            let aged = retention_secs > 0
                                && desc.file_creation_time > 0
                                && now_unix.saturating_sub(desc.file_creation_time)
                                    > retention_secs;
                            let expired = expire && desc.exp_seconds < now_dtn;
                            aged || expired
                        })
                        .map(|desc| (dirname.clone(), desc.filename.clone()))
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        if victims.is_empty() {
            return;
        }

        let mut removed = 0usize;
        for (dirname, filename) in victims {
            if self.delete_tracked_file(&dirname, &filename).is_some() {
                removed += 1;
                self.state.lock().totals.deleted += 1;
            }
        }
        info!(
            "restage link {}: retention sweep deleted {removed} file(s)",
            self.link_name
        );
        self.update_cl_state();
    }

    fn post_reload_event(&self, event: ReloadEvent) {
        if self.reload_tx.send(event).is_err() {
            error!(
                "restage link {}: reload event dropped (reloader gone)",
                self.link_name
            );
        }
    }

    /// Human-oriented per-link dump: statistics then the file list.
    pub fn dump_link(&self) -> String {
        let state = self.state.lock();
        let mut out = String::new();

        out.push_str(&format!(
            "Link {}: storage {} state {}\n",
            self.link_name,
            self.params.storage_path.display(),
            self.status.cl_state()
        ));
        out.push_str(&format!(
            "  restaged: {}  dupes ignored: {}  errors: {}  reloaded: {}  deleted: {}\n",
            state.totals.restaged,
            state.totals.dupes_ignored,
            state.totals.errors,
            state.totals.reloaded,
            state.totals.deleted
        ));
        out.push_str(&format!(
            "  tracked: {} file(s), {} byte(s) of disk\n",
            state.grand_total_num_files, state.grand_total_num_bytes
        ));

        for (dirname, stats) in &state.dir_stats {
            out.push_str(&format!(
                "  {dirname}: {} file(s), {} byte(s)\n",
                stats.num_files, stats.total_size
            ));
            if let Some(files) = state.restage_dirs.get(dirname) {
                for desc in files.values() {
                    out.push_str(&format!(
                        "    {} ({} bytes{})\n",
                        desc.filename,
                        desc.file_size,
                        if desc.error_count > 0 {
                            format!(", {} read error(s)", desc.error_count)
                        } else {
                            String::new()
                        }
                    ));
                }
            }
        }
        out
    }
}

/// The scheme of the side a descriptor was restaged under.
pub(crate) fn scheme_of(desc: &BundleFileDesc) -> NamingScheme {
    match desc.quota_type {
        QuotaType::Src => desc.src_scheme,
        QuotaType::Dst => desc.dst_scheme,
    }
}

/// The node name of the side a descriptor was restaged under.
pub(crate) fn nodename_of(desc: &BundleFileDesc) -> String {
    match desc.quota_type {
        QuotaType::Src => desc.src_nodename.clone(),
        QuotaType::Dst => desc.dst_nodename.clone(),
    }
}

impl RestageClIf for RestageController {
    fn reload_all(&self, new_expiration: u64) -> usize {
        let dirnames: Vec<String> = {
            let state = self.state.lock();
            state
                .restage_dirs
                .iter()
                .filter(|(_, files)| !files.is_empty())
                .map(|(d, _)| d.clone())
                .collect()
        };

        for dirname in &dirnames {
            self.post_reload_event(ReloadEvent::Reload {
                dirname: dirname.clone(),
                new_expiration,
                new_dest_eid: None,
            });
        }
        dirnames.len()
    }

    fn reload(
        &self,
        quota_type: QuotaType,
        scheme: NamingScheme,
        nodename: &str,
        new_expiration: u64,
        new_dest_eid: Option<String>,
    ) -> usize {
        let dirname = format_dir_name(quota_type, scheme, nodename, &self.sep);

        let present = {
            let state = self.state.lock();
            state
                .restage_dirs
                .get(&dirname)
                .is_some_and(|files| !files.is_empty())
        };
        if !present {
            return 0;
        }

        self.post_reload_event(ReloadEvent::Reload {
            dirname,
            new_expiration,
            new_dest_eid,
        });
        1
    }

    fn delete_restaged_bundles(
        &self,
        quota_type: QuotaType,
        scheme: NamingScheme,
        nodename: &str,
    ) -> usize {
        let dirname = format_dir_name(quota_type, scheme, nodename, &self.sep);

        let present = {
            let state = self.state.lock();
            state
                .restage_dirs
                .get(&dirname)
                .is_some_and(|files| !files.is_empty())
        };
        if !present {
            return 0;
        }

        self.post_reload_event(ReloadEvent::Delete { dirname });
        1
    }

    fn delete_all_restaged_bundles(&self) -> usize {
        let dirnames: Vec<String> = {
            let state = self.state.lock();
            state
                .restage_dirs
                .iter()
                .filter(|(_, files)| !files.is_empty())
                .map(|(d, _)| d.clone())
                .collect()
        };

        for dirname in &dirnames {
            self.post_reload_event(ReloadEvent::Delete {
                dirname: dirname.clone(),
            });
        }
        dirnames.len()
    }

    fn pause_for_rescan(&self) {
        self.paused.store(true, Ordering::Release);
    }

    fn resume_after_rescan(&self) {
        self.paused.store(false, Ordering::Release);
    }

    fn rescan(&self) {
        self.perform_rescan.store(true, Ordering::Release);
    }

    fn send_email_notifications(&self, subject: &str, body: &str) {
        spawn_emailer(
            self.mailer.clone(),
            self.params.email_from.clone(),
            self.params.email_to.clone(),
            subject.to_string(),
            body.to_string(),
        );
    }
}

/// The controller loop: rescans, volume stats, state machine, retention
/// sweep and the auto-reload timer.
fn run_controller(ctl: Arc<RestageController>, flag: &crate::runtime::StopFlag) {
    const VOLUME_REFRESH: Duration = Duration::from_secs(10);
    const GC_INTERVAL: Duration = Duration::from_secs(3_600);

    while !flag.should_stop() {
        if ctl.perform_rescan.swap(false, Ordering::AcqRel) {
            match scan_external_storage(&ctl) {
                Ok(()) => {}
                Err(e) => error!(
                    "restage link {}: rescan failed: {e}",
                    ctl.link_name()
                ),
            }
            ctl.with_bard(|bard| bard.rescan_completed());
        }

        let (do_volume, do_gc, do_reload) = {
            let mut state = ctl.state.lock();
            let now = Instant::now();

            let do_volume = now.duration_since(state.last_volume_refresh) >= VOLUME_REFRESH;
            if do_volume {
                state.last_volume_refresh = now;
            }

            let do_gc = now.duration_since(state.last_gc) >= GC_INTERVAL;
            if do_gc {
                state.last_gc = now;
            }

            let reload_interval = ctl.status.auto_reload_interval();
            let do_reload = reload_interval > 0
                && now.duration_since(state.last_auto_reload).as_secs() >= reload_interval;
            if do_reload {
                state.last_auto_reload = now;
            }

            (do_volume, do_gc, do_reload)
        };

        if do_volume {
            ctl.refresh_volume_stats();
            ctl.update_cl_state();
        }
        if do_gc && !ctl.is_paused() {
            ctl.do_garbage_collection();
        }
        if do_reload && !ctl.is_paused() {
            let queued = ctl.reload_all(ctl.status.ttl_override());
            if queued > 0 {
                info!(
                    "restage link {}: auto reload queued {queued} directories",
                    ctl.link_name()
                );
            }
        }

        interruptible_sleep(flag, Duration::from_millis(200));
    }
}

/// Per the mount-point rule: the storage path must sit on a different
/// device than its parent directory. Returns the canonicalized path.
#[cfg(unix)]
fn validate_mount_point(path: &Path) -> Result<String> {
    use std::os::unix::fs::MetadataExt;

    let meta = std::fs::metadata(path)
        .map_err(|e| BardError::io(path.display().to_string(), e))?;
    let parent = path
        .parent()
        .ok_or_else(|| BardError::NotAMountPoint(path.display().to_string()))?;
    let parent_meta = std::fs::metadata(parent)
        .map_err(|e| BardError::io(parent.display().to_string(), e))?;

    if meta.dev() == parent_meta.dev() {
        return Err(BardError::NotAMountPoint(path.display().to_string()));
    }

    let canonical = std::fs::canonicalize(path)
        .map_err(|e| BardError::io(path.display().to_string(), e))?;
    Ok(canonical.display().to_string())
}

#[cfg(not(unix))]
fn validate_mount_point(path: &Path) -> Result<String> {
    Err(BardError::NotAMountPoint(path.display().to_string()))
}

/// (total bytes, available bytes, block size) for the volume holding `path`.
#[cfg(unix)]
pub(crate) fn volume_stats(path: &Path) -> std::io::Result<(u64, u64, u64)> {
    use std::os::unix::ffi::OsStrExt;

    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;

    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut stats) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let frsize = if stats.f_frsize == 0 {
        4096
    } else {
        stats.f_frsize as u64
    };
    Ok((
        stats.f_blocks as u64 * frsize,
        stats.f_bavail as u64 * frsize,
        frsize,
    ))
}

#[cfg(not(unix))]
pub(crate) fn volume_stats(_path: &Path) -> std::io::Result<(u64, u64, u64)> {
    Ok((0, 0, 4096))
}

/// Round a file size up to whole volume blocks.
pub(crate) fn block_rounded(file_size: u64, block_size: u64) -> u64 {
    let block = if block_size == 0 { 4096 } else { block_size };
    file_size.div_ceil(block) * block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_rounding() {
        assert_eq!(block_rounded(0, 4096), 0);
        assert_eq!(block_rounded(1, 4096), 4096);
        assert_eq!(block_rounded(4096, 4096), 4096);
        assert_eq!(block_rounded(4097, 4096), 8192);
        assert_eq!(block_rounded(100, 0), 4096);
    }

    #[test]
    #[cfg(unix)]
    fn plain_directory_is_not_a_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("storage");
        std::fs::create_dir(&sub).unwrap();
        assert!(matches!(
            validate_mount_point(&sub),
            Err(BardError::NotAMountPoint(_))
        ));
    }

    #[test]
    #[cfg(unix)]
    fn volume_stats_reports_something() {
        let (total, available, block) = volume_stats(Path::new("/")).unwrap();
        assert!(total > 0);
        assert!(block > 0);
        assert!(available <= total);
    }

    struct NullSink;

    impl crate::BundleSink for NullSink {
        fn deliver(&self, _bundle: crate::bundle::Bundle) -> crate::error::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn expiry_sweep_deletes_only_expired_files() {
        use crate::bundle::{Bundle, PendingBundles};
        use crate::daemon::{Bard, BardParams};
        use crate::store::MemStore;
        use bard_eid::EndpointId;
        use std::sync::Arc;
        use std::time::Duration;

        let storage = tempfile::tempdir().unwrap();
        let gate = crate::runtime::StartGate::new();
        let bard = Bard::new(
            BardParams::default(),
            Arc::new(MemStore::new()),
            PendingBundles::new(),
        );
        bard.start(gate.clone()).unwrap();

        bard.bardcmd_add_quota(
            QuotaType::Dst,
            NamingScheme::Ipn,
            "30",
            1,
            0,
            false,
            "restage0",
            false,
            0,
            0,
        )
        .unwrap();

        let params = super::super::RestageParams {
            storage_path: storage.path().to_path_buf(),
            mount_point: false,
            auto_reload_interval: 0,
            email_enabled: false,
            expire_bundles: true,
            days_retention: 0,
            disk_quota: 10_000_000_000,
            min_disk_space_available: 0,
            ..Default::default()
        };
        let ctl = RestageController::spawn(
            "restage0",
            params,
            &bard,
            Arc::new(NullSink),
            Arc::new(super::super::LogMailer),
            gate.clone(),
        )
        .unwrap();
        gate.release();

        let keeper = Arc::new(Bundle::new(
            EndpointId::parse("ipn:900.1").unwrap(),
            EndpointId::parse("ipn:30.1").unwrap(),
            1,
            1,
            vec![0u8; 10],
            crate::dtntime::now_dtn_secs() + 3_600,
        ));
        assert!(bard.query_accept_bundle(&keeper));
        bard.bundle_accepted(&keeper);

        // one bundle already expired, one with plenty of lifetime left
        let submit = |seq: u64, exp: u64| {
            let b = Arc::new(Bundle::new(
                EndpointId::parse("ipn:900.1").unwrap(),
                EndpointId::parse("ipn:30.1").unwrap(),
                1_000,
                seq,
                vec![0u8; 64],
                exp,
            ));
            assert!(bard.query_accept_bundle(&b));
            assert!(b.restage_link_name().is_some());
            bard.restage_link("restage0").unwrap().enqueue(b.clone()).unwrap();
            b
        };
        let expired = submit(1, 1);
        let live = submit(2, crate::dtntime::now_dtn_secs() + 86_400);

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while ctl.totals().restaged != 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(ctl.totals().restaged, 2);
        bard.bundle_deleted(&expired);
        bard.bundle_deleted(&live);

        ctl.do_garbage_collection();

        assert_eq!(ctl.totals().deleted, 1);
        assert_eq!(ctl.tracked_files(), 1);
        let rec = bard
            .usage_record(QuotaType::Dst, NamingScheme::Ipn, "30")
            .unwrap();
        assert_eq!(rec.inuse_external_bundles, 1);

        ctl.shutdown();
        bard.shutdown();
    }
}
