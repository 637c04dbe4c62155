//! The bundle model seen by the restaging daemon.
//!
//! Only the pieces the daemon needs are modeled: endpoints, the creation
//! timestamp tuple, fragment info, the payload and the expiration, plus the
//! per-side reservation scalars the daemon uses to guarantee a bundle is
//! never charged twice against the same quota.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bard_eid::{EndpointId, QuotaType};
use bard_fname::BundleFileDesc;

static NEXT_BUNDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Per-side (dst/src) reservation and in-use scalars.
///
/// Each scalar holds the charged payload length while the charge is live and
/// zero otherwise, so repeated acceptance queries and release paths can tell
/// whether a charge is already in place.
#[derive(Debug, Default)]
struct QuotaTracking {
    quota_reserved: [AtomicU64; 2],
    extquota_reserved: [AtomicU64; 2],
    in_use: [AtomicU64; 2],
    restage_by_src: AtomicBool,
    restage_link_name: Mutex<Option<String>>,
}

fn side_index(side: QuotaType) -> usize {
    match side {
        QuotaType::Dst => 0,
        QuotaType::Src => 1,
    }
}

/// A bundle in internal storage.
#[derive(Debug)]
pub struct Bundle {
    id: u64,
    source: EndpointId,
    dest: EndpointId,
    /// BPv7 bundles carry their creation time in milliseconds since the DTN
    /// epoch, BPv6 in seconds.
    bpv7: bool,
    creation_ts: u64,
    seq_num: u64,
    is_fragment: bool,
    frag_offset: u64,
    /// Payload length of the original bundle (equal to the payload length
    /// unless this bundle is a fragment).
    orig_payload_len: u64,
    payload: Vec<u8>,
    /// Absolute expiration, seconds since the DTN epoch.
    exp_seconds: u64,

    tracking: QuotaTracking,
}

impl Bundle {
    pub fn new(
        source: EndpointId,
        dest: EndpointId,
        creation_ts: u64,
        seq_num: u64,
        payload: Vec<u8>,
        exp_seconds: u64,
    ) -> Self {
        let orig_payload_len = payload.len() as u64;
        Self {
            id: NEXT_BUNDLE_ID.fetch_add(1, Ordering::Relaxed),
            source,
            dest,
            bpv7: true,
            creation_ts,
            seq_num,
            is_fragment: false,
            frag_offset: 0,
            orig_payload_len,
            payload,
            exp_seconds,
            tracking: QuotaTracking::default(),
        }
    }

    /// Mark this bundle as a fragment of a larger payload.
    pub fn into_fragment(mut self, frag_offset: u64, orig_payload_len: u64) -> Self {
        self.is_fragment = true;
        self.frag_offset = frag_offset;
        self.orig_payload_len = orig_payload_len;
        self
    }

    pub fn set_bpv7(&mut self, bpv7: bool) {
        self.bpv7 = bpv7;
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn source(&self) -> &EndpointId {
        &self.source
    }

    pub fn dest(&self) -> &EndpointId {
        &self.dest
    }

    pub fn is_bpv7(&self) -> bool {
        self.bpv7
    }

    pub fn creation_ts(&self) -> u64 {
        self.creation_ts
    }

    pub fn seq_num(&self) -> u64 {
        self.seq_num
    }

    pub fn is_fragment(&self) -> bool {
        self.is_fragment
    }

    pub fn frag_offset(&self) -> u64 {
        self.frag_offset
    }

    pub fn orig_payload_len(&self) -> u64 {
        self.orig_payload_len
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_len(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Payload length as charged against quotas: a zero-length payload is
    /// charged as one byte so it still shows up in the accounting.
    pub fn charged_payload_len(&self) -> u64 {
        self.payload_len().max(1)
    }

    pub fn exp_seconds(&self) -> u64 {
        self.exp_seconds
    }

    /// The EID governing the given quota side.
    pub fn eid_for(&self, side: QuotaType) -> &EndpointId {
        match side {
            QuotaType::Dst => &self.dest,
            QuotaType::Src => &self.source,
        }
    }

    /// The internal-storage reservation scalar for one side.
    pub fn quota_reserved(&self, side: QuotaType) -> u64 {
        self.tracking.quota_reserved[side_index(side)].load(Ordering::Acquire)
    }

    pub fn set_quota_reserved(&self, side: QuotaType, len: u64) {
        self.tracking.quota_reserved[side_index(side)].store(len, Ordering::Release);
    }

    /// The external-storage reservation scalar for one side.
    pub fn extquota_reserved(&self, side: QuotaType) -> u64 {
        self.tracking.extquota_reserved[side_index(side)].load(Ordering::Acquire)
    }

    pub fn set_extquota_reserved(&self, side: QuotaType, len: u64) {
        self.tracking.extquota_reserved[side_index(side)].store(len, Ordering::Release);
    }

    /// The internal-storage in-use scalar for one side.
    pub fn in_use(&self, side: QuotaType) -> u64 {
        self.tracking.in_use[side_index(side)].load(Ordering::Acquire)
    }

    pub fn set_in_use(&self, side: QuotaType, len: u64) {
        self.tracking.in_use[side_index(side)].store(len, Ordering::Release);
    }

    /// Which side's quota routed this bundle to external storage.
    pub fn restage_by_src(&self) -> bool {
        self.tracking.restage_by_src.load(Ordering::Acquire)
    }

    pub fn set_restage_by_src(&self, by_src: bool) {
        self.tracking.restage_by_src.store(by_src, Ordering::Release);
    }

    /// The restage link chosen by the acceptance oracle, if any.
    pub fn restage_link_name(&self) -> Option<String> {
        self.tracking.restage_link_name.lock().unwrap().clone()
    }

    pub fn set_restage_link_name(&self, link_name: &str) {
        *self.tracking.restage_link_name.lock().unwrap() = Some(link_name.to_string());
    }

    pub fn clear_restage_link_name(&self) {
        *self.tracking.restage_link_name.lock().unwrap() = None;
    }

    /// Build the external-storage descriptor for this bundle. The caller
    /// sets the quota type from the directory it restages into.
    pub fn to_file_desc(&self, quota_type: QuotaType) -> BundleFileDesc {
        BundleFileDesc {
            quota_type,
            src_scheme: self.source.scheme(),
            src_nodename: self.source.node_name(),
            src_node_number: self.source.node_number(),
            src_service: self.source.service_name(),
            dst_scheme: self.dest.scheme(),
            dst_nodename: self.dest.node_name(),
            dst_node_number: self.dest.node_number(),
            dst_service: self.dest.service_name(),
            bts_secs_or_millisecs: self.creation_ts,
            bts_seq_num: self.seq_num,
            is_frag: self.is_fragment,
            frag_offset: self.frag_offset,
            frag_length: if self.is_fragment {
                self.payload_len()
            } else {
                0
            },
            orig_payload_length: self.orig_payload_len,
            payload_length: self.payload_len(),
            exp_seconds: self.exp_seconds,
            ..Default::default()
        }
    }
}

/// The node's set of bundles currently in internal storage, keyed by bundle
/// id. The force-restage sweep walks it newest first.
#[derive(Debug, Default)]
pub struct PendingBundles {
    inner: Mutex<BTreeMap<u64, Arc<Bundle>>>,
}

impl PendingBundles {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, bundle: Arc<Bundle>) {
        self.inner.lock().unwrap().insert(bundle.id(), bundle);
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Bundle>> {
        self.inner.lock().unwrap().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// The bundle with the largest id strictly below `before`, or the newest
    /// bundle when `before` is `u64::MAX`.
    pub fn find_prev(&self, before: u64) -> Option<Arc<Bundle>> {
        let inner = self.inner.lock().unwrap();
        inner.range(..before).next_back().map(|(_, b)| b.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> Bundle {
        Bundle::new(
            EndpointId::parse("ipn:977.12").unwrap(),
            EndpointId::parse("ipn:31.6").unwrap(),
            100,
            7,
            vec![0u8; 64],
            1_000,
        )
    }

    #[test]
    fn ids_are_unique() {
        let a = bundle();
        let b = bundle();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn zero_payload_is_charged_one_byte() {
        let b = Bundle::new(
            EndpointId::parse("ipn:1.1").unwrap(),
            EndpointId::parse("ipn:2.1").unwrap(),
            0,
            0,
            Vec::new(),
            10,
        );
        assert_eq!(b.payload_len(), 0);
        assert_eq!(b.charged_payload_len(), 1);
    }

    #[test]
    fn per_side_scalars_are_independent() {
        let b = bundle();
        b.set_quota_reserved(QuotaType::Src, 64);
        assert_eq!(b.quota_reserved(QuotaType::Src), 64);
        assert_eq!(b.quota_reserved(QuotaType::Dst), 0);

        b.set_in_use(QuotaType::Dst, 64);
        assert_eq!(b.in_use(QuotaType::Dst), 64);
        assert_eq!(b.in_use(QuotaType::Src), 0);
    }

    #[test]
    fn fragment_descriptor_reports_both_lengths() {
        let b = Bundle::new(
            EndpointId::parse("ipn:977.12").unwrap(),
            EndpointId::parse("dtn://alpha/x").unwrap(),
            200,
            3,
            vec![1u8; 2_000],
            5_000,
        )
        .into_fragment(1_000, 4_000);

        let desc = b.to_file_desc(QuotaType::Dst);
        assert!(desc.is_frag);
        assert_eq!(desc.frag_offset, 1_000);
        assert_eq!(desc.frag_length, 2_000);
        assert_eq!(desc.orig_payload_length, 4_000);
        assert_eq!(desc.payload_length, 2_000);
    }

    #[test]
    fn pending_walks_newest_first() {
        let pending = PendingBundles::new();
        let ids: Vec<u64> = (0..5)
            .map(|_| {
                let b = Arc::new(bundle());
                let id = b.id();
                pending.insert(b);
                id
            })
            .collect();

        let mut seen = Vec::new();
        let mut cursor = u64::MAX;
        while let Some(b) = pending.find_prev(cursor) {
            cursor = b.id();
            seen.push(b.id());
        }

        let mut expect = ids.clone();
        expect.reverse();
        assert_eq!(seen, expect);
    }
}
