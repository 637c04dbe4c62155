//! End-to-end tests of the restage/reload/rescan machinery against a real
//! directory tree.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bard::restage::{LogMailer, RestageController, RestageParams};
use bard::runtime::StartGate;
use bard::store::MemStore;
use bard::{Bard, BardParams, Bundle, BundleSink, PendingBundles};
use bard_eid::{EndpointId, NamingScheme, QuotaType};

/// Inbound path for reloaded bundles: accounts them as accepted and counts
/// deliveries.
struct TestSink {
    bard: std::sync::Mutex<Option<Arc<Bard>>>,
    delivered: AtomicUsize,
}

impl TestSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bard: std::sync::Mutex::new(None),
            delivered: AtomicUsize::new(0),
        })
    }

    fn attach(&self, bard: &Arc<Bard>) {
        *self.bard.lock().unwrap() = Some(bard.clone());
    }

    fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }
}

impl BundleSink for TestSink {
    fn deliver(&self, bundle: Bundle) -> bard::Result<()> {
        let bard = self
            .bard
            .lock()
            .unwrap()
            .clone()
            .expect("sink attached before use");
        let bundle = Arc::new(bundle);
        bard.bundle_accepted(&bundle);
        bard.pending().insert(bundle);
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    bard: Arc<Bard>,
    sink: Arc<TestSink>,
    ctl: Arc<RestageController>,
    _storage: tempfile::TempDir,
}

impl Harness {
    /// Daemon plus one restage link named `restage0` on a temp directory.
    fn up() -> Self {
        let storage = tempfile::tempdir().unwrap();
        let gate = StartGate::new();

        let bard = Bard::new(
            BardParams::default(),
            Arc::new(MemStore::new()),
            PendingBundles::new(),
        );
        bard.start(gate.clone()).unwrap();

        let sink = TestSink::new();
        sink.attach(&bard);

        let params = RestageParams {
            storage_path: storage.path().to_path_buf(),
            mount_point: false,
            auto_reload_interval: 0,
            email_enabled: false,
            disk_quota: 10_000_000_000,
            min_disk_space_available: 0,
            ..Default::default()
        };
        let ctl = RestageController::spawn(
            "restage0",
            params,
            &bard,
            sink.clone(),
            Arc::new(LogMailer),
            gate.clone(),
        )
        .unwrap();

        gate.release();
        Self {
            bard,
            sink,
            ctl,
            _storage: storage,
        }
    }

    fn down(self) {
        self.ctl.shutdown();
        self.bard.shutdown();
    }

    /// Install a quota that keeps one bundle internally and overflows the
    /// rest to restage0.
    fn overflow_quota(&self, node: &str) {
        self.bard
            .bardcmd_add_quota(
                QuotaType::Dst,
                NamingScheme::Ipn,
                node,
                1,
                0,
                false,
                "restage0",
                false,
                0,
                0,
            )
            .unwrap();
    }

    /// Push a bundle through acceptance. Tagged bundles are queued on the
    /// restage link (reservations held); the rest are committed internally.
    fn submit(&self, bundle: Arc<Bundle>) -> bool {
        if !self.bard.query_accept_bundle(&bundle) {
            self.bard.bundle_deleted(&bundle);
            return false;
        }
        self.bard.pending().insert(bundle.clone());

        if let Some(link_name) = bundle.restage_link_name() {
            let link = self.bard.restage_link(&link_name).expect("link registered");
            link.enqueue(bundle).unwrap();
        } else {
            self.bard.bundle_accepted(&bundle);
        }
        true
    }

    fn ext_record(&self, node: &str) -> bard::usage::UsageRecord {
        self.bard
            .usage_record(QuotaType::Dst, NamingScheme::Ipn, node)
            .expect("record exists")
    }
}

fn bundle_seq(node: &str, payload: usize, seq: u64) -> Arc<Bundle> {
    Arc::new(Bundle::new(
        EndpointId::parse("ipn:900.1").unwrap(),
        EndpointId::parse(&format!("ipn:{node}.1")).unwrap(),
        820_000_000_000,
        seq,
        vec![0xA5; payload],
        900_000_000,
    ))
}

fn wait_for(what: &str, mut pred: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if pred() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {what}");
}

#[test_log::test]
fn restage_then_reload_round_trip() {
    let h = Harness::up();
    h.overflow_quota("7");

    // first bundle fits internally
    let b1 = bundle_seq("7", 100, 1);
    assert!(h.submit(b1.clone()));
    assert!(b1.restage_link_name().is_none());

    // second overflows to the restage link
    let b2 = bundle_seq("7", 200, 2);
    assert!(h.submit(b2.clone()));

    wait_for("restage to complete", || h.ctl.totals().restaged == 1);

    // the file landed in the destination-keyed directory
    let dir = h._storage.path().join("dst_ipn_7");
    let files: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
    assert_eq!(files.len(), 1);

    let rec = h.ext_record("7");
    assert_eq!(rec.inuse_external_bundles, 1);
    assert!(rec.inuse_external_bytes > 0);
    assert_eq!(rec.reserved_external_bundles, 0);

    // the node now drops the internal copy of the restaged bundle
    h.bard.pending().remove(b2.id());
    h.bard.bundle_deleted(&b2);

    // free the internal slot so the reload can be admitted
    h.bard.pending().remove(b1.id());
    h.bard.bundle_deleted(&b1);

    let msg = h
        .bard
        .bardcmd_reload(QuotaType::Dst, NamingScheme::Ipn, "7", 0, None)
        .unwrap();
    assert!(msg.contains("queued"));

    wait_for("reload to complete", || h.ctl.totals().reloaded == 1);
    wait_for("delivery", || h.sink.delivered() == 1);

    let rec = h.ext_record("7");
    assert_eq!(rec.inuse_external_bundles, 0);
    assert_eq!(rec.inuse_external_bytes, 0);
    assert_eq!(rec.inuse_internal_bundles, 1, "reloaded copy is internal");

    assert!(std::fs::read_dir(&dir).unwrap().next().is_none(), "file deleted");

    h.down();
}

#[test_log::test]
fn duplicate_restage_is_counted_and_ignored() {
    let h = Harness::up();
    h.overflow_quota("8");

    let keeper = bundle_seq("8", 100, 1);
    assert!(h.submit(keeper));

    // two distinct bundle objects with identical descriptors
    let b1 = bundle_seq("8", 300, 7);
    let b2 = bundle_seq("8", 300, 7);
    assert!(h.submit(b1));
    assert!(h.submit(b2.clone()));

    wait_for("restage plus dupe", || {
        let t = h.ctl.totals();
        t.restaged == 1 && t.dupes_ignored == 1
    });

    let rec = h.ext_record("8");
    assert_eq!(rec.inuse_external_bundles, 1, "dupe not double counted");

    // the duplicate's reservations unwind when its internal copy goes away
    h.bard.pending().remove(b2.id());
    h.bard.bundle_deleted(&b2);
    let rec = h.ext_record("8");
    assert_eq!(rec.reserved_external_bundles, 0);
    assert_eq!(rec.reserved_external_bytes, 0);

    h.down();
}

#[test_log::test]
fn delete_restaged_bundles_command_empties_the_directory() {
    let h = Harness::up();
    h.overflow_quota("9");

    assert!(h.submit(bundle_seq("9", 100, 1)));
    for seq in 2..5 {
        let b = bundle_seq("9", 500, seq);
        assert!(h.submit(b.clone()));
        wait_for("restage", || h.ctl.totals().restaged == seq - 1);
        h.bard.pending().remove(b.id());
        h.bard.bundle_deleted(&b);
    }

    let rec = h.ext_record("9");
    assert_eq!(rec.inuse_external_bundles, 3);

    let msg = h
        .bard
        .bardcmd_del_restaged_bundles(QuotaType::Dst, NamingScheme::Ipn, "9")
        .unwrap();
    assert!(msg.contains("queued"));

    wait_for("deletes", || h.ctl.totals().deleted == 3);

    let rec = h.ext_record("9");
    assert_eq!(rec.inuse_external_bundles, 0);
    assert_eq!(rec.inuse_external_bytes, 0);

    let dir = h._storage.path().join("dst_ipn_9");
    assert!(std::fs::read_dir(&dir).unwrap().next().is_none());

    h.down();
}

#[test_log::test]
fn rescan_reconciles_files_removed_behind_the_daemons_back() {
    let h = Harness::up();
    h.overflow_quota("12");

    assert!(h.submit(bundle_seq("12", 100, 1)));
    for seq in 2..5 {
        let b = bundle_seq("12", 400, seq);
        assert!(h.submit(b.clone()));
        wait_for("restage", || h.ctl.totals().restaged == seq - 1);
        h.bard.pending().remove(b.id());
        h.bard.bundle_deleted(&b);
    }
    assert_eq!(h.ext_record("12").inuse_external_bundles, 3);

    // an operator deletes one file out from under the daemon
    let dir = h._storage.path().join("dst_ipn_12");
    let victim = std::fs::read_dir(&dir).unwrap().next().unwrap().unwrap();
    std::fs::remove_file(victim.path()).unwrap();

    let msg = h.bard.bardcmd_rescan().unwrap();
    assert!(msg.contains("rescan initiated"));

    wait_for("rescan to rebuild the counts", || {
        h.ext_record("12").inuse_external_bundles == 2
    });

    let rec = h.ext_record("12");
    assert_eq!(rec.last_inuse_external_bundles, 3, "pre-rescan snapshot");
    assert_eq!(h.ctl.tracked_files(), 2);

    // the workers resumed: another overflow bundle still restages
    let b = bundle_seq("12", 400, 99);
    assert!(h.submit(b));
    wait_for("post-rescan restage", || h.ctl.totals().restaged == 4);

    h.down();
}

#[test_log::test]
fn second_rescan_with_no_changes_is_idempotent() {
    let h = Harness::up();
    h.overflow_quota("13");

    assert!(h.submit(bundle_seq("13", 100, 1)));
    for seq in 2..4 {
        let b = bundle_seq("13", 250, seq);
        assert!(h.submit(b.clone()));
        wait_for("restage", || h.ctl.totals().restaged == seq - 1);
        h.bard.pending().remove(b.id());
        h.bard.bundle_deleted(&b);
    }

    h.bard.bardcmd_rescan().unwrap();
    wait_for("first rescan", || {
        h.ext_record("13").last_inuse_external_bundles == 2
            && h.ext_record("13").inuse_external_bundles == 2
    });
    let first = h.ext_record("13");

    h.bard.bardcmd_rescan().unwrap();
    wait_for("second rescan", || {
        h.ext_record("13").last_inuse_external_bundles == 2
            && h.ext_record("13").inuse_external_bundles == 2
    });
    let second = h.ext_record("13");

    assert_eq!(first.inuse_external_bundles, second.inuse_external_bundles);
    assert_eq!(first.inuse_external_bytes, second.inuse_external_bytes);

    h.down();
}

#[test_log::test]
fn startup_scan_adopts_preexisting_files() {
    // restage a bundle, shut everything down, then bring up a fresh daemon
    // over the same directory: the scan must rebuild the accounting
    let storage = tempfile::tempdir().unwrap();

    {
        let gate = StartGate::new();
        let bard = Bard::new(
            BardParams::default(),
            Arc::new(MemStore::new()),
            PendingBundles::new(),
        );
        bard.start(gate.clone()).unwrap();
        let sink = TestSink::new();
        sink.attach(&bard);

        bard.bardcmd_add_quota(
            QuotaType::Dst,
            NamingScheme::Ipn,
            "21",
            1,
            0,
            false,
            "restage0",
            false,
            0,
            0,
        )
        .unwrap();

        let params = RestageParams {
            storage_path: storage.path().to_path_buf(),
            mount_point: false,
            auto_reload_interval: 0,
            email_enabled: false,
            disk_quota: 10_000_000_000,
            min_disk_space_available: 0,
            ..Default::default()
        };
        let ctl = RestageController::spawn(
            "restage0",
            params,
            &bard,
            sink.clone(),
            Arc::new(LogMailer),
            gate.clone(),
        )
        .unwrap();
        gate.release();

        let keeper = bundle_seq("21", 10, 1);
        assert!(bard.query_accept_bundle(&keeper));
        bard.bundle_accepted(&keeper);

        let b = bundle_seq("21", 123, 2);
        assert!(bard.query_accept_bundle(&b));
        assert!(b.restage_link_name().is_some());
        bard.restage_link("restage0").unwrap().enqueue(b.clone()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while ctl.totals().restaged != 1 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(ctl.totals().restaged, 1);

        bard.bundle_deleted(&b);
        ctl.shutdown();
        bard.shutdown();
    }

    // fresh daemon over the same storage root
    let gate = StartGate::new();
    let bard = Bard::new(
        BardParams::default(),
        Arc::new(MemStore::new()),
        PendingBundles::new(),
    );
    bard.start(gate.clone()).unwrap();
    let sink = TestSink::new();
    sink.attach(&bard);

    let params = RestageParams {
        storage_path: storage.path().to_path_buf(),
        mount_point: false,
        auto_reload_interval: 0,
        email_enabled: false,
        disk_quota: 10_000_000_000,
        min_disk_space_available: 0,
        ..Default::default()
    };
    let ctl = RestageController::spawn(
        "restage0",
        params,
        &bard,
        sink,
        Arc::new(LogMailer),
        gate.clone(),
    )
    .unwrap();
    gate.release();

    assert_eq!(ctl.tracked_files(), 1);
    let rec = bard
        .usage_record(QuotaType::Dst, NamingScheme::Ipn, "21")
        .unwrap();
    assert_eq!(rec.inuse_external_bundles, 1);
    assert!(rec.inuse_external_bytes > 0);

    ctl.shutdown();
    bard.shutdown();
}

#[test_log::test]
fn foreign_files_are_ignored_by_the_scan() {
    let storage = tempfile::tempdir().unwrap();
    std::fs::create_dir(storage.path().join("lost+found")).unwrap();
    std::fs::create_dir(storage.path().join("dst_ipn_5")).unwrap();
    std::fs::write(storage.path().join("dst_ipn_5").join("README"), b"hi").unwrap();

    let gate = StartGate::new();
    let bard = Bard::new(
        BardParams::default(),
        Arc::new(MemStore::new()),
        PendingBundles::new(),
    );
    bard.start(gate.clone()).unwrap();
    let sink = TestSink::new();
    sink.attach(&bard);

    let params = RestageParams {
        storage_path: storage.path().to_path_buf(),
        mount_point: false,
        auto_reload_interval: 0,
        email_enabled: false,
        disk_quota: 10_000_000_000,
        min_disk_space_available: 0,
        ..Default::default()
    };
    let ctl = RestageController::spawn(
        "restage0",
        params,
        &bard,
        sink,
        Arc::new(LogMailer),
        gate.clone(),
    )
    .unwrap();
    gate.release();

    assert_eq!(ctl.tracked_files(), 0);
    let rec = bard.usage_record(QuotaType::Dst, NamingScheme::Ipn, "5");
    assert!(rec.is_none() || rec.unwrap().inuse_external_bundles == 0);

    ctl.shutdown();
    bard.shutdown();
}
