//! The parsed description of one restaged-bundle file.

use bard_eid::{NamingScheme, QuotaType};

/// Everything that can be learned about a restaged bundle from its directory
/// name and filename, plus the bookkeeping the convergence layer tracks per
/// file while it sits in external storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFileDesc {
    pub filename: String,

    /// Set from the directory the file lives in.
    pub quota_type: QuotaType,

    pub src_scheme: NamingScheme,
    pub src_nodename: String,
    pub src_node_number: u64,
    pub src_service: String,

    pub dst_scheme: NamingScheme,
    pub dst_nodename: String,
    pub dst_node_number: u64,
    pub dst_service: String,

    /// Creation time, seconds (BPv6) or milliseconds (BPv7) since the DTN
    /// epoch. Carried opaquely; the record inside the file knows which.
    pub bts_secs_or_millisecs: u64,
    pub bts_seq_num: u64,

    pub is_frag: bool,
    pub frag_offset: u64,
    pub frag_length: u64,

    /// Payload length of the original bundle.
    pub orig_payload_length: u64,
    /// Payload length of this bundle (the fragment length for fragments).
    pub payload_length: u64,

    /// Expiration, seconds since the DTN epoch.
    pub exp_seconds: u64,

    pub file_size: u64,
    pub disk_usage: u64,
    pub file_creation_time: u64,

    /// Open/read failures seen for this file; used to quarantine bad files.
    pub error_count: u32,
}

impl BundleFileDesc {
    /// The payload length with the zero-length fudge applied, as charged
    /// against quotas.
    pub fn charged_payload_length(&self) -> u64 {
        self.payload_length.max(1)
    }
}

impl Default for BundleFileDesc {
    fn default() -> Self {
        Self {
            filename: String::new(),
            quota_type: QuotaType::Dst,
            src_scheme: NamingScheme::Ipn,
            src_nodename: String::new(),
            src_node_number: 0,
            src_service: String::new(),
            dst_scheme: NamingScheme::Ipn,
            dst_nodename: String::new(),
            dst_node_number: 0,
            dst_service: String::new(),
            bts_secs_or_millisecs: 0,
            bts_seq_num: 0,
            is_frag: false,
            frag_offset: 0,
            frag_length: 0,
            orig_payload_length: 0,
            payload_length: 0,
            exp_seconds: 0,
            file_size: 0,
            disk_usage: 0,
            file_creation_time: 0,
            error_count: 0,
        }
    }
}
