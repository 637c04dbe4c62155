//! The Bundle Archival Restaging Daemon: the acceptance oracle, the quota
//! and usage registry, the restage link registry and the rescan
//! coordinator.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{error, info, warn};

use bard_eid::{NamingScheme, QuotaKey, QuotaType};

use crate::bundle::{Bundle, PendingBundles};
use crate::error::Result;
use crate::force_restage::spawn_force_restage;
use crate::link::Link;
use crate::restage::{RestageClIf, RestageClStatus, LOCK_RANK_BARD};
use crate::runtime::{interruptible_sleep, OrderedMutex, StartGate, Worker};
use crate::store::{DurableStore, QuotaStore};
use crate::usage::{UsageRecord, UsageTable};

/// Daemon-wide tunables.
#[derive(Debug, Clone)]
pub struct BardParams {
    pub enabled: bool,
    /// Length of the email notification frequency period; each quota-reached
    /// condition notifies at most once per period.
    pub email_frequency_period_secs: u64,
}

impl Default for BardParams {
    fn default() -> Self {
        Self {
            enabled: true,
            email_frequency_period_secs: 3_600,
        }
    }
}

/// A registered restage convergence layer.
pub(crate) struct RegisteredCl {
    pub status: Arc<RestageClStatus>,
    pub ctl: Arc<dyn RestageClIf>,
    pub link: Arc<Link>,
}

pub(crate) struct BardState {
    started: bool,
    pub table: UsageTable,
    pub restagecls: BTreeMap<String, RegisteredCl>,

    /// Throttle state for "unknown restage link" error messages.
    last_not_found_link: String,
    last_not_found_time: Option<Instant>,

    pub total_restaged: u64,
    pub total_deleted_restaged: u64,

    pub rescanning: bool,
    expected_rescan_responses: usize,
    rescan_responses: usize,
    rescan_initiated: Option<Instant>,
}

/// A pending quota-reached notification, fired after the table lock drops.
struct QuotaAlert {
    link_name: String,
    subject: String,
    body: String,
}

/// The daemon. One per node; every acceptance decision and every counter
/// mutation goes through the single table lock.
pub struct Bard {
    params: BardParams,
    pub(crate) state: OrderedMutex<BardState>,
    quota_store: QuotaStore,
    pending: Arc<PendingBundles>,
    watchdog: Mutex<Option<Worker>>,
}

/// How long a rescan may run before the daemon gives up on it.
const RESCAN_TIMEOUT: Duration = Duration::from_secs(300);
/// Hold-off between auto-reload commands for one record.
const AUTO_RELOAD_HOLDOFF: Duration = Duration::from_secs(600);

impl Bard {
    pub fn new(
        params: BardParams,
        store: Arc<dyn DurableStore>,
        pending: Arc<PendingBundles>,
    ) -> Arc<Self> {
        Arc::new(Self {
            params,
            state: OrderedMutex::new(
                "bard_table",
                LOCK_RANK_BARD,
                BardState {
                    started: false,
                    table: UsageTable::new(),
                    restagecls: BTreeMap::new(),
                    last_not_found_link: String::new(),
                    last_not_found_time: None,
                    total_restaged: 0,
                    total_deleted_restaged: 0,
                    rescanning: false,
                    expected_rescan_responses: 0,
                    rescan_responses: 0,
                    rescan_initiated: None,
                },
            ),
            quota_store: QuotaStore::new(store),
            pending,
            watchdog: Mutex::new(None),
        })
    }

    pub fn pending(&self) -> Arc<PendingBundles> {
        self.pending.clone()
    }

    /// Load stored quotas (the store wins over startup configuration),
    /// mark the daemon started and spawn the watchdog.
    pub fn start(self: &Arc<Self>, gate: Arc<StartGate>) -> Result<()> {
        self.load_saved_quotas()?;
        self.state.lock().started = true;

        let daemon = self.clone();
        let worker = Worker::spawn("bard-watchdog", gate, move |flag| {
            let mut last_email_sweep = Instant::now();
            while !flag.should_stop() {
                daemon.check_rescan_timeout();
                if last_email_sweep.elapsed() >= Duration::from_secs(10) {
                    last_email_sweep = Instant::now();
                    daemon.reset_email_periods();
                }
                interruptible_sleep(&flag, Duration::from_millis(100));
            }
        });
        *self.watchdog.lock().unwrap() = Some(worker);
        Ok(())
    }

    pub fn shutdown(&self) {
        if let Some(mut worker) = self.watchdog.lock().unwrap().take() {
            worker.shutdown();
        }
    }

    fn check_rescan_timeout(&self) {
        let mut state = self.state.lock();
        if state.rescanning {
            let expired = state
                .rescan_initiated
                .is_some_and(|t| t.elapsed() > RESCAN_TIMEOUT);
            if expired {
                error!(
                    "external storage rescan did not complete within {}s; clearing rescan state",
                    RESCAN_TIMEOUT.as_secs()
                );
                state.rescanning = false;
            }
        }
    }

    fn reset_email_periods(&self) {
        let period = self.params.email_frequency_period_secs;
        let mut state = self.state.lock();
        for rec in state.table.iter_usage_mut() {
            rec.check_email_frequency_period(period);
        }
    }

    fn load_saved_quotas(&self) -> Result<()> {
        info!("loading quotas from data store");
        let stored = self.quota_store.load_all()?;

        let mut to_persist: Vec<UsageRecord> = Vec::new();
        {
            let mut state = self.state.lock();
            for rec in stored {
                let key = rec.key().to_string();
                if state.table.has_quota_entry(&key) {
                    // startup configuration also declared this quota: the
                    // stored copy wins
                    let existing = state.table.get_mut(&key).expect("quota entry has record");
                    existing.set_quota_internal_bundles(rec.quota_internal_bundles());
                    existing.set_quota_internal_bytes(rec.quota_internal_bytes());
                    existing.set_quota_external_bundles(rec.quota_external_bundles());
                    existing.set_quota_external_bytes(rec.quota_external_bytes());
                    existing.set_quota_refuse_bundle(rec.quota_refuse_bundle());
                    existing.set_quota_auto_reload(rec.quota_auto_reload());
                    existing.set_quota_restage_link_name(rec.quota_restage_link_name());
                    existing.set_quota_modified(false);
                    existing.set_quota_in_datastore(true);
                } else {
                    let key = rec.key().to_string();
                    let slot = state.table.get_or_insert(
                        rec.quota_type(),
                        rec.naming_scheme(),
                        rec.nodename(),
                    );
                    *slot = rec;
                    state.table.insert_quota_key(&key);
                }
            }

            // new configuration entries not yet stored get written back
            for rec in state.table.iter_quotas() {
                if !rec.quota_in_datastore() {
                    to_persist.push(rec.clone());
                }
            }
            for rec in &to_persist {
                let existing = state.table.get_mut(rec.key()).expect("record exists");
                existing.set_quota_in_datastore(true);
                existing.set_quota_modified(false);
            }
        }

        for rec in &to_persist {
            self.persist_quota(rec, false);
        }
        Ok(())
    }

    /// Write one record's quota fields to the store.
    fn persist_quota(&self, rec: &UsageRecord, update: bool) {
        let store = self.quota_store.store();
        store.begin_transaction();
        let result = if update {
            self.quota_store.update(rec)
        } else {
            self.quota_store.add(rec)
        };
        store.end_transaction();

        if let Err(e) = result {
            error!("error writing quota {} to data store: {e}", rec.key());
        }
    }

    fn delete_persisted_quota(&self, key: &str) {
        let store = self.quota_store.store();
        store.begin_transaction();
        let result = self.quota_store.del(key);
        store.end_transaction();

        if let Err(e) = result {
            error!("error deleting quota {key} from data store: {e}");
        }
    }

    // ----------------------------------------------------------------
    // acceptance oracle
    // ----------------------------------------------------------------

    /// May this bundle be accepted? Evaluated independently for the source
    /// and destination keys; both must agree. Reservations are placed as a
    /// side effect; repeated calls for the same bundle do not double
    /// reserve.
    pub fn query_accept_bundle(&self, bundle: &Bundle) -> bool {
        if !self.params.enabled {
            return true;
        }

        let mut state = self.state.lock();
        let by_src = query_accept_side(&mut state, bundle, QuotaType::Src);
        let by_dst = query_accept_side(&mut state, bundle, QuotaType::Dst);
        by_src && by_dst
    }

    /// May a restaged bundle re-enter internal storage? Checks internal
    /// quota only; external usage is irrelevant at reload time.
    pub fn query_accept_reload_bundle(
        &self,
        quota_type: QuotaType,
        scheme: NamingScheme,
        nodename: &str,
        payload_len: u64,
    ) -> bool {
        let payload_len = payload_len.max(1);
        let key = QuotaKey::new(quota_type, scheme, nodename).to_key_string();

        let state = self.state.lock();
        let Some(rec) = state.table.get_quota(&key) else {
            return true;
        };
        if !rec.has_quota() {
            return true;
        }

        if rec.quota_internal_bundles() > 0
            && rec.committed_internal_bundles() >= rec.quota_internal_bundles()
        {
            return false;
        }
        if rec.quota_internal_bytes() > 0
            && rec.committed_internal_bytes() + payload_len > rec.quota_internal_bytes()
        {
            return false;
        }
        true
    }

    /// The bundle is now in internal storage: move reservations to in-use on
    /// both sides.
    pub fn bundle_accepted(&self, bundle: &Bundle) {
        let mut alerts = Vec::new();
        {
            let mut state = self.state.lock();
            bundle_accepted_side(&mut state, bundle, QuotaType::Dst, &mut alerts);
            bundle_accepted_side(&mut state, bundle, QuotaType::Src, &mut alerts);
        }
        self.fire_alerts(alerts);
    }

    /// The bundle has been written to external storage: promote the
    /// external reservation to external in-use on the side it was restaged
    /// under.
    pub fn bundle_restaged(&self, bundle: &Bundle, disk_usage: u64) {
        let mut state = self.state.lock();
        bundle_restaged_side(&mut state, bundle, QuotaType::Dst, disk_usage);
        bundle_restaged_side(&mut state, bundle, QuotaType::Src, disk_usage);
    }

    /// The bundle left internal storage: reverse any live reservations and
    /// in-use charges on both sides, and consider an auto reload.
    pub fn bundle_deleted(&self, bundle: &Bundle) {
        let mut state = self.state.lock();
        bundle_deleted_side(&mut state, bundle, QuotaType::Dst);
        bundle_deleted_side(&mut state, bundle, QuotaType::Src);
    }

    /// A restaged file was deleted (reloaded, expired or by command).
    /// Counts may be out of sync after a rescan, so this clamps at zero
    /// rather than asserting.
    pub fn restaged_bundle_deleted(
        &self,
        quota_type: QuotaType,
        scheme: NamingScheme,
        nodename: &str,
        disk_usage: u64,
    ) {
        let key = QuotaKey::new(quota_type, scheme, nodename).to_key_string();
        let mut state = self.state.lock();
        state.total_deleted_restaged += 1;

        let Some(rec) = state.table.get_mut(&key) else {
            error!("restaged_bundle_deleted: key not found: {key}");
            return;
        };

        if rec.inuse_external_bundles >= 1 {
            rec.inuse_external_bundles -= 1;
        } else {
            info!("restaged_bundle_deleted: clamping external bundle count for {key}");
        }
        if rec.inuse_external_bytes >= disk_usage {
            rec.inuse_external_bytes -= disk_usage;
        } else {
            info!("restaged_bundle_deleted: clamping external byte count for {key}");
            rec.inuse_external_bytes = 0;
        }
    }

    /// Republished external usage from a scan or rescan.
    pub fn update_restage_usage_stats(
        &self,
        quota_type: QuotaType,
        scheme: NamingScheme,
        nodename: &str,
        num_files: u64,
        disk_usage: u64,
    ) {
        let mut state = self.state.lock();
        let rec = state.table.get_or_insert(quota_type, scheme, nodename);
        rec.inuse_external_bundles += num_files;
        rec.inuse_external_bytes += disk_usage;
    }

    fn fire_alerts(&self, alerts: Vec<QuotaAlert>) {
        if alerts.is_empty() {
            return;
        }
        let state = self.state.lock();
        for alert in alerts {
            if let Some(cl) = state.restagecls.get(&alert.link_name) {
                cl.ctl.send_email_notifications(&alert.subject, &alert.body);
            } else {
                warn!("{}: {}", alert.subject, alert.body);
            }
        }
    }

    // ----------------------------------------------------------------
    // restage link registry
    // ----------------------------------------------------------------

    pub fn register_restage_cl(
        &self,
        status: Arc<RestageClStatus>,
        ctl: Arc<dyn RestageClIf>,
        link: Arc<Link>,
    ) {
        let name = status.link_name().to_string();
        let mut state = self.state.lock();

        if state.restagecls.remove(&name).is_some() {
            error!(
                "restage link registration with an existing name ({name}); \
                 dropping the old instance"
            );
        }
        state.restagecls.insert(name, RegisteredCl { status, ctl, link });
    }

    pub fn unregister_restage_cl(&self, link_name: &str) {
        let mut state = self.state.lock();
        state.restagecls.remove(link_name);
    }

    /// The outbound queue of a registered restage link.
    pub fn restage_link(&self, link_name: &str) -> Option<Arc<Link>> {
        let state = self.state.lock();
        state.restagecls.get(link_name).map(|cl| cl.link.clone())
    }

    /// Called by each restage link when its rescan finishes.
    pub fn rescan_completed(&self) {
        let mut state = self.state.lock();

        if !state.rescanning {
            error!("received rescan_completed notification while no rescan is in progress");
            return;
        }

        state.rescan_responses += 1;
        if state.rescan_responses == state.expected_rescan_responses {
            info!(
                "completed rescan of external storage - all {} restage link(s) reported",
                state.expected_rescan_responses
            );
            state.rescanning = false;
            for cl in state.restagecls.values() {
                cl.ctl.resume_after_rescan();
            }
        } else {
            info!(
                "rescan of external storage in progress - {} of {} restage link(s) reported",
                state.rescan_responses, state.expected_rescan_responses
            );
        }
    }

    // ----------------------------------------------------------------
    // command surface
    // ----------------------------------------------------------------

    /// Create or update a quota. Returns a warning message when the new
    /// quota is already exceeded by current usage.
    #[allow(clippy::too_many_arguments)]
    pub fn bardcmd_add_quota(
        &self,
        quota_type: QuotaType,
        scheme: NamingScheme,
        nodename: &str,
        internal_bundles: u64,
        internal_bytes: u64,
        refuse_bundle: bool,
        restage_link_name: &str,
        auto_reload: bool,
        external_bundles: u64,
        external_bytes: u64,
    ) -> std::result::Result<String, String> {
        scheme
            .parse_node(nodename)
            .map_err(|e| e.to_string())?;

        let mut warning = String::new();
        let (snapshot, update) = {
            let mut state = self.state.lock();
            let started = state.started;

            let rec = state.table.get_or_insert(quota_type, scheme, nodename);
            let was_in_datastore = rec.quota_in_datastore();

            rec.set_quota_internal_bundles(internal_bundles);
            rec.set_quota_internal_bytes(internal_bytes);
            rec.set_quota_refuse_bundle(refuse_bundle);
            rec.set_quota_restage_link_name(restage_link_name);
            rec.set_quota_auto_reload(auto_reload);
            rec.set_quota_external_bundles(external_bundles);
            rec.set_quota_external_bytes(external_bytes);

            let over_bundles =
                internal_bundles > 0 && rec.inuse_internal_bundles > internal_bundles;
            let over_bytes = internal_bytes > 0 && rec.inuse_internal_bytes > internal_bytes;
            if over_bundles || over_bytes {
                if refuse_bundle {
                    warning = "new quota is below current bundles in internal storage \
                               but it is too late to refuse them\n"
                        .to_string();
                } else {
                    warning = format!(
                        "new quota is below current bundles in internal storage\n\
                         over-quota bundles can be restaged with:\n    \
                         bard force_restage {} {} {}\n",
                        quota_type, scheme, nodename
                    );
                }
            }

            let key = rec.key().to_string();
            state.table.insert_quota_key(&key);

            if started {
                let rec = state.table.get_mut(&key).expect("record exists");
                rec.set_quota_in_datastore(true);
                rec.set_quota_modified(false);
                (Some(rec.clone()), was_in_datastore)
            } else {
                (None, false)
            }
        };

        if let Some(rec) = snapshot {
            self.persist_quota(&rec, update);
        }
        Ok(warning)
    }

    /// Clear a quota. The record remains for accounting.
    pub fn bardcmd_delete_quota(
        &self,
        quota_type: QuotaType,
        scheme: NamingScheme,
        nodename: &str,
    ) -> std::result::Result<(), String> {
        let key = QuotaKey::new(quota_type, scheme, nodename).to_key_string();

        let (found, started, was_in_datastore) = {
            let mut state = self.state.lock();
            let started = state.started;
            if !state.table.has_quota_entry(&key) {
                (false, started, false)
            } else {
                let rec = state.table.get_mut(&key).expect("quota entry has record");
                let was = rec.quota_in_datastore();
                rec.clear_quota();
                rec.set_quota_in_datastore(false);
                state.table.remove_quota_key(&key);
                (true, started, was)
            }
        };

        if !found {
            return Err(format!("no quota found for {quota_type} {scheme} {nodename}"));
        }
        if started && was_in_datastore {
            self.delete_persisted_quota(&key);
        }
        Ok(())
    }

    /// Set a quota entry to unlimited. Unlike delete, the entry is kept in
    /// the quota table (and the datastore) so it overrides a startup
    /// configuration on restart.
    pub fn bardcmd_unlimited_quota(
        &self,
        quota_type: QuotaType,
        scheme: NamingScheme,
        nodename: &str,
    ) -> std::result::Result<(), String> {
        scheme
            .parse_node(nodename)
            .map_err(|e| e.to_string())?;

        let (snapshot, update) = {
            let mut state = self.state.lock();
            let started = state.started;

            let rec = state.table.get_or_insert(quota_type, scheme, nodename);
            let was_in_datastore = rec.quota_in_datastore();
            rec.clear_quota();

            let key = rec.key().to_string();
            state.table.insert_quota_key(&key);

            if started {
                let rec = state.table.get_mut(&key).expect("record exists");
                rec.set_quota_in_datastore(true);
                rec.set_quota_modified(false);
                (Some(rec.clone()), was_in_datastore)
            } else {
                (None, false)
            }
        };

        if let Some(rec) = snapshot {
            self.persist_quota(&rec, update);
        }
        Ok(())
    }

    /// Kick off a sweep restaging over-quota bundles for one key.
    pub fn bardcmd_force_restage(
        self: &Arc<Self>,
        quota_type: QuotaType,
        scheme: NamingScheme,
        nodename: &str,
    ) -> std::result::Result<(), String> {
        let key = QuotaKey::new(quota_type, scheme, nodename).to_key_string();

        let (over, link_name, node_number) = {
            let state = self.state.lock();
            let Some(rec) = state.table.get_quota(&key) else {
                return Err(format!("no quota found for {quota_type} {scheme} {nodename}"));
            };
            if rec.quota_refuse_bundle() {
                return Err("quota is configured to refuse, not restage".to_string());
            }
            (
                rec.over_quota(),
                rec.quota_restage_link_name().to_string(),
                rec.node_number(),
            )
        };

        if let Some((bundles_over, bytes_over)) = over {
            spawn_force_restage(
                self.clone(),
                quota_type,
                scheme,
                nodename.to_string(),
                node_number,
                bundles_over,
                bytes_over,
                link_name,
            );
        }
        Ok(())
    }

    /// Initiate a rescan of all external storage.
    pub fn bardcmd_rescan(&self) -> std::result::Result<String, String> {
        {
            let mut state = self.state.lock();
            if state.rescanning {
                return Err("rescan is already in progress - ignored".to_string());
            }

            // claim the rescan before dropping the lock for the quiesce
            // sleep so a second command cannot interleave
            state.rescanning = true;
            state.rescan_initiated = Some(Instant::now());
            state.expected_rescan_responses = 0;
            state.rescan_responses = 0;

            // admissions during the quiesce window read the snapshot
            for rec in state.table.iter_usage_mut() {
                rec.last_inuse_external_bundles = rec.inuse_external_bundles;
                rec.last_inuse_external_bytes = rec.inuse_external_bytes;
            }

            for cl in state.restagecls.values() {
                cl.ctl.pause_for_rescan();
            }
        }

        // let in-flight restage/reload file operations finish
        std::thread::sleep(Duration::from_secs(1));

        let mut state = self.state.lock();

        for rec in state.table.iter_usage_mut() {
            rec.last_inuse_external_bundles = rec.inuse_external_bundles;
            rec.last_inuse_external_bytes = rec.inuse_external_bytes;
            rec.inuse_external_bundles = 0;
            rec.inuse_external_bytes = 0;
        }

        let mut expected = 0;
        for cl in state.restagecls.values() {
            cl.ctl.rescan();
            expected += 1;
        }

        state.expected_rescan_responses = expected;
        state.rescanning = expected > 0;
        state.rescan_initiated = Some(Instant::now());

        if state.rescanning {
            Ok("rescan initiated".to_string())
        } else {
            Ok("no restage links registered for a rescan".to_string())
        }
    }

    /// Queue reload events for one key across every restage link.
    pub fn bardcmd_reload(
        &self,
        quota_type: QuotaType,
        scheme: NamingScheme,
        nodename: &str,
        new_expiration: u64,
        new_dest_eid: Option<String>,
    ) -> std::result::Result<String, String> {
        let state = self.state.lock();
        if state.restagecls.is_empty() {
            return Err("no registered restage links".to_string());
        }

        let mut num_dirs = 0;
        for cl in state.restagecls.values() {
            num_dirs += cl.ctl.reload(
                quota_type,
                scheme,
                nodename,
                new_expiration,
                new_dest_eid.clone(),
            );
        }

        if num_dirs == 0 {
            Ok("no restage links hold bundles of that type".to_string())
        } else {
            Ok("reload event(s) queued to be processed".to_string())
        }
    }

    pub fn bardcmd_reload_all(
        &self,
        new_expiration: u64,
    ) -> std::result::Result<String, String> {
        let state = self.state.lock();
        if state.restagecls.is_empty() {
            return Err("no registered restage links".to_string());
        }

        let mut num_dirs = 0;
        for cl in state.restagecls.values() {
            num_dirs += cl.ctl.reload_all(new_expiration);
        }

        if num_dirs == 0 {
            Ok("no restage links hold restaged bundles".to_string())
        } else {
            Ok("reload event(s) queued to be processed".to_string())
        }
    }

    pub fn bardcmd_del_restaged_bundles(
        &self,
        quota_type: QuotaType,
        scheme: NamingScheme,
        nodename: &str,
    ) -> std::result::Result<String, String> {
        let state = self.state.lock();
        if state.restagecls.is_empty() {
            return Err("no registered restage links".to_string());
        }

        let mut num_dirs = 0;
        for cl in state.restagecls.values() {
            num_dirs += cl.ctl.delete_restaged_bundles(quota_type, scheme, nodename);
        }

        if num_dirs == 0 {
            Ok("no restage links hold bundles of that type".to_string())
        } else {
            Ok("delete event(s) queued to be processed".to_string())
        }
    }

    pub fn bardcmd_del_all_restaged_bundles(&self) -> std::result::Result<String, String> {
        let state = self.state.lock();
        if state.restagecls.is_empty() {
            return Err("no registered restage links".to_string());
        }

        let mut num_dirs = 0;
        for cl in state.restagecls.values() {
            num_dirs += cl.ctl.delete_all_restaged_bundles();
        }

        if num_dirs == 0 {
            Ok("no restage links hold restaged bundles".to_string())
        } else {
            Ok("delete event(s) queued to be processed".to_string())
        }
    }

    /// Copies of every usage record, for reporting surfaces that must not
    /// sit on the table lock.
    pub fn usage_snapshot(&self) -> Vec<UsageRecord> {
        let state = self.state.lock();
        state.table.iter_usage().cloned().collect()
    }

    /// A copy of one usage record.
    pub fn usage_record(
        &self,
        quota_type: QuotaType,
        scheme: NamingScheme,
        nodename: &str,
    ) -> Option<UsageRecord> {
        let key = QuotaKey::new(quota_type, scheme, nodename).to_key_string();
        let state = self.state.lock();
        state.table.get(&key).cloned()
    }

    pub fn bardcmd_quotas(&self, exact: bool) -> String {
        let state = self.state.lock();
        crate::report::quotas_report(&state, exact)
    }

    pub fn bardcmd_usage(&self, exact: bool) -> String {
        let state = self.state.lock();
        crate::report::usage_report(&state, exact)
    }

    pub fn bardcmd_dump(&self) -> String {
        let state = self.state.lock();
        crate::report::dump_report(&state)
    }
}

// --------------------------------------------------------------------
// per-side helpers (all run under the table lock)
// --------------------------------------------------------------------

fn query_accept_side(state: &mut BardState, bundle: &Bundle, side: QuotaType) -> bool {
    let payload_len = bundle.charged_payload_len();
    let eid = bundle.eid_for(side);
    let key = QuotaKey::for_eid(side, eid).to_key_string();

    let mut okay_to_accept = true;

    if state.table.has_quota_entry(&key) {
        let rec = state.table.get(&key).expect("quota entry has record");

        if rec.has_quota() {
            // internal capacity
            if rec.quota_internal_bundles() > 0
                && rec.committed_internal_bundles() >= rec.quota_internal_bundles()
            {
                okay_to_accept = false;
            }
            if okay_to_accept
                && rec.quota_internal_bytes() > 0
                && rec.committed_internal_bytes() + payload_len > rec.quota_internal_bytes()
            {
                okay_to_accept = false;
            }

            // overflow to external storage
            if !okay_to_accept && !rec.quota_refuse_bundle() {
                okay_to_accept = true;

                if rec.quota_external_bundles() > 0 {
                    let committed = if state.rescanning {
                        rec.last_committed_external_bundles()
                    } else {
                        rec.committed_external_bundles()
                    };
                    if committed >= rec.quota_external_bundles() {
                        okay_to_accept = false;
                    }
                }
                if okay_to_accept && rec.quota_external_bytes() > 0 {
                    let committed = if state.rescanning {
                        rec.last_committed_external_bytes()
                    } else {
                        rec.committed_external_bytes()
                    };
                    if committed + payload_len > rec.quota_external_bytes() {
                        okay_to_accept = false;
                    }
                }

                if okay_to_accept {
                    // capacity exists on paper; is a storage location usable?
                    let preferred = rec.quota_restage_link_name().to_string();
                    match find_restage_link_in_good_state(state, &preferred) {
                        Some(link_name) => {
                            let rec =
                                state.table.get_mut(&key).expect("quota entry has record");
                            if bundle.extquota_reserved(side) != payload_len {
                                rec.reserved_external_bundles += 1;
                                rec.reserved_external_bytes += payload_len;
                                bundle.set_extquota_reserved(side, payload_len);
                            }
                            bundle.set_restage_by_src(side.is_src());
                            bundle.set_restage_link_name(&link_name);
                        }
                        None => okay_to_accept = false,
                    }
                }
            }
        }
    }

    // regardless of the verdict, reserve internal capacity: the bundle is
    // physically resident until it is refused or restaged, and acceptance
    // may be retried from several convergence layers
    let scheme = eid.scheme();
    let nodename = eid.node_name();
    let rec = state.table.get_or_insert(side, scheme, &nodename);
    if bundle.quota_reserved(side) != payload_len {
        rec.reserved_internal_bundles += 1;
        rec.reserved_internal_bytes += payload_len;
        bundle.set_quota_reserved(side, payload_len);
    }

    okay_to_accept
}

/// Find a usable restage link, preferring `preferred`. When the preferred
/// link is pooled (or unknown) any pooled ONLINE link qualifies. Errors are
/// throttled to one message per link per ten minutes.
fn find_restage_link_in_good_state(state: &mut BardState, preferred: &str) -> Option<String> {
    let mut pooled_link = true;

    let preferred_cl = state.restagecls.get(preferred);
    if let Some(cl) = preferred_cl {
        pooled_link = cl.status.part_of_pool();
        if cl.status.cl_state().is_good() {
            return Some(preferred.to_string());
        }
    }

    if pooled_link {
        for (name, cl) in &state.restagecls {
            if cl.status.part_of_pool() && cl.status.cl_state().is_good() {
                return Some(name.clone());
            }
        }
    }

    // nothing usable: log, throttled
    if let Some(cl) = state.restagecls.get(preferred) {
        if cl.status.may_log_error() {
            error!(
                "unable to accept bundle into restage storage: link {preferred} \
                 is not in a good state: {}",
                cl.status.cl_state()
            );
        }
    } else {
        let repeat = state.last_not_found_link == preferred;
        let throttled = repeat
            && state
                .last_not_found_time
                .is_some_and(|t| t.elapsed().as_secs() < 600);
        if !throttled {
            error!("unable to accept bundle into unknown restage storage link {preferred}");
            state.last_not_found_link = preferred.to_string();
            state.last_not_found_time = Some(Instant::now());
        }
    }

    None
}

fn bundle_accepted_side(
    state: &mut BardState,
    bundle: &Bundle,
    side: QuotaType,
    alerts: &mut Vec<QuotaAlert>,
) {
    let payload_len = bundle.charged_payload_len();
    let eid = bundle.eid_for(side);
    let scheme = eid.scheme();
    let nodename = eid.node_name();

    let rec = state.table.get_or_insert(side, scheme, &nodename);

    // reverse any reservations
    let reserved = bundle.quota_reserved(side);
    if reserved > 0 {
        assert!(rec.reserved_internal_bundles >= 1, "internal bundle reservation underflow");
        assert!(
            rec.reserved_internal_bytes >= reserved,
            "internal byte reservation underflow"
        );
        rec.reserved_internal_bundles -= 1;
        rec.reserved_internal_bytes -= reserved;
        bundle.set_quota_reserved(side, 0);
    }

    let ext_reserved = bundle.extquota_reserved(side);
    if ext_reserved > 0 {
        assert!(rec.reserved_external_bundles >= 1, "external bundle reservation underflow");
        assert!(
            rec.reserved_external_bytes >= ext_reserved,
            "external byte reservation underflow"
        );
        rec.reserved_external_bundles -= 1;
        rec.reserved_external_bytes -= ext_reserved;
        bundle.set_extquota_reserved(side, 0);
    }
    bundle.clear_restage_link_name();

    // charge in-use
    rec.inuse_internal_bundles += 1;
    rec.inuse_internal_bytes += payload_len;
    bundle.set_in_use(side, payload_len);

    // rising usage removes the auto-reload hold-off so a later dip can
    // trigger a reload immediately
    if rec.inuse_external_bundles > 0
        && rec.last_reload_command_time.is_some()
        && rec.max_committed_quota_percent() >= 40
    {
        rec.last_reload_command_time = None;
    }

    // one-shot quota-reached notification per frequency period
    if rec.has_quota()
        && rec.max_committed_quota_percent() >= 100
        && !rec.email_sent_internal_quota_reached
        && !rec.quota_restage_link_name().is_empty()
    {
        rec.email_sent_internal_quota_reached = true;
        if rec.email_freq_period_start.is_none() {
            rec.email_freq_period_start = Some(Instant::now());
        }
        alerts.push(QuotaAlert {
            link_name: rec.quota_restage_link_name().to_string(),
            subject: format!("storage quota reached for {}", rec.key().trim()),
            body: format!(
                "internal storage quota reached: {} bundles / {} bytes in use",
                rec.inuse_internal_bundles, rec.inuse_internal_bytes
            ),
        });
    }
}

fn bundle_restaged_side(state: &mut BardState, bundle: &Bundle, side: QuotaType, disk_usage: u64) {
    let eid = bundle.eid_for(side);
    let scheme = eid.scheme();
    let nodename = eid.node_name();

    let rec = state.table.get_or_insert(side, scheme, &nodename);

    let ext_reserved = bundle.extquota_reserved(side);
    if ext_reserved > 0 {
        assert!(rec.reserved_external_bundles >= 1, "external bundle reservation underflow");
        assert!(
            rec.reserved_external_bytes >= ext_reserved,
            "external byte reservation underflow"
        );
        rec.reserved_external_bundles -= 1;
        rec.reserved_external_bytes -= ext_reserved;
        bundle.set_extquota_reserved(side, 0);
    }
    bundle.clear_restage_link_name();

    // only the side the bundle was restaged under picks up the in-use
    // charge; the other side never had its reservation promoted
    if bundle.restage_by_src() == side.is_src() {
        state.total_restaged += 1;
        let rec = state.table.get_or_insert(side, scheme, &nodename);
        rec.inuse_external_bundles += 1;
        rec.inuse_external_bytes += disk_usage;
    }
}

fn bundle_deleted_side(state: &mut BardState, bundle: &Bundle, side: QuotaType) {
    let eid = bundle.eid_for(side);
    let scheme = eid.scheme();
    let nodename = eid.node_name();

    let rec = state.table.get_or_insert(side, scheme, &nodename);

    let reserved = bundle.quota_reserved(side);
    if reserved > 0 {
        assert!(rec.reserved_internal_bundles >= 1, "internal bundle reservation underflow");
        assert!(
            rec.reserved_internal_bytes >= reserved,
            "internal byte reservation underflow"
        );
        rec.reserved_internal_bundles -= 1;
        rec.reserved_internal_bytes -= reserved;
        bundle.set_quota_reserved(side, 0);
    }

    let ext_reserved = bundle.extquota_reserved(side);
    if ext_reserved > 0 {
        assert!(rec.reserved_external_bundles >= 1, "external bundle reservation underflow");
        assert!(
            rec.reserved_external_bytes >= ext_reserved,
            "external byte reservation underflow"
        );
        rec.reserved_external_bundles -= 1;
        rec.reserved_external_bytes -= ext_reserved;
        bundle.set_extquota_reserved(side, 0);
    }
    bundle.clear_restage_link_name();

    let in_use = bundle.in_use(side);
    if in_use > 0 {
        assert!(rec.inuse_internal_bundles >= 1, "internal bundle in-use underflow");
        assert!(
            rec.inuse_internal_bytes >= in_use,
            "internal byte in-use underflow"
        );
        rec.inuse_internal_bundles -= 1;
        rec.inuse_internal_bytes -= in_use;
        bundle.set_in_use(side, 0);
    }

    // usage dipped: maybe time to bring restaged bundles home
    if rec.inuse_external_bundles > 0
        && rec.quota_auto_reload()
        && rec.max_committed_quota_percent() <= 20
    {
        let held_off = rec
            .last_reload_command_time
            .is_some_and(|t| t.elapsed() <= AUTO_RELOAD_HOLDOFF);
        if !held_off {
            let quota_type = rec.quota_type();
            let rec_scheme = rec.naming_scheme();
            let rec_nodename = rec.nodename().to_string();

            let mut num_dirs = 0;
            for cl in state.restagecls.values() {
                num_dirs += cl.ctl.reload(quota_type, rec_scheme, &rec_nodename, 0, None);
            }

            let rec = state.table.get_or_insert(side, scheme, &nodename);
            if num_dirs > 0 {
                info!(
                    "auto reload issued for {} ({num_dirs} directories)",
                    rec.key().trim()
                );
            }
            rec.last_reload_command_time = Some(Instant::now());
        }
    }
}


#[cfg(test)]
mod random_tests {
    use super::tests_support::*;
    use super::*;
    use bard_eid::EndpointId;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    /// Arbitrary interleavings of accept/refuse/delete leave every counter
    /// where it started.
    #[test]
    fn randomized_accept_delete_sequences_conserve_counters() {
        let bard = test_daemon();
        bard.bardcmd_add_quota(
            QuotaType::Dst,
            NamingScheme::Ipn,
            "42",
            64,
            100_000,
            true,
            "",
            false,
            0,
            0,
        )
        .unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        let mut live: Vec<Arc<Bundle>> = Vec::new();

        for _ in 0..400 {
            if rng.gen_bool(0.6) || live.is_empty() {
                let payload = rng.gen_range(0..2_048);
                let b = Arc::new(Bundle::new(
                    EndpointId::parse("ipn:900.1").unwrap(),
                    EndpointId::parse("ipn:42.1").unwrap(),
                    1,
                    rng.gen(),
                    vec![0u8; payload],
                    100_000,
                ));
                if bard.query_accept_bundle(&b) {
                    bard.bundle_accepted(&b);
                    live.push(b);
                } else {
                    bard.bundle_deleted(&b);
                }
            } else {
                let idx = rng.gen_range(0..live.len());
                let b = live.swap_remove(idx);
                bard.bundle_deleted(&b);
            }
        }
        for b in live.drain(..) {
            bard.bundle_deleted(&b);
        }

        for (qt, node) in [(QuotaType::Dst, "42"), (QuotaType::Src, "900")] {
            let rec = bard.usage_record(qt, NamingScheme::Ipn, node).unwrap();
            assert_eq!(rec.inuse_internal_bundles, 0);
            assert_eq!(rec.inuse_internal_bytes, 0);
            assert_eq!(rec.reserved_internal_bundles, 0);
            assert_eq!(rec.reserved_internal_bytes, 0);
            assert_eq!(rec.reserved_external_bundles, 0);
            assert_eq!(rec.reserved_external_bytes, 0);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::store::MemStore;

    pub(crate) fn test_daemon() -> Arc<Bard> {
        Bard::new(
            BardParams::default(),
            Arc::new(MemStore::new()),
            PendingBundles::new(),
        )
    }
}
