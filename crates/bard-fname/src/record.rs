//! The binary record stored inside a restaged-bundle file.
//!
//! The filename already carries the full descriptor; the record repeats the
//! metadata so a file that has been renamed or copied out of its directory
//! is still self-describing, and carries the payload bytes.

use binrw::prelude::*;
use binrw::NullString;
use modular_bitfield::prelude::*;

use crate::Result;

/// Per-record flag byte.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFlags {
    /// Bundle protocol version 7 (creation timestamp in milliseconds).
    pub bpv7: bool,
    pub is_frag: bool,
    #[skip]
    __: B6,
}

/// On-disk restaged-bundle record, little endian, magic `BRDF`.
#[binrw::binrw]
#[derive(Debug, PartialEq, Eq)]
#[brw(little, magic = b"BRDF")]
pub struct RestageFileRecord {
    #[bw(calc = 1)]
    #[br(assert(_version == 1))]
    _version: u8,

    #[br(map = |b: u8| RecordFlags::from_bytes([b]))]
    #[bw(map = |f: &RecordFlags| f.into_bytes()[0])]
    pub flags: RecordFlags,

    pub src_eid: NullString,
    pub dst_eid: NullString,

    pub creation_ts: u64,
    pub seq_num: u64,

    pub frag_offset: u64,
    pub frag_length: u64,
    pub orig_payload_length: u64,

    pub exp_seconds: u64,

    #[bw(try_calc = payload.len().try_into())]
    _payload_length: u64,
    #[br(count = _payload_length)]
    pub payload: Vec<u8>,
}

impl RestageFileRecord {
    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        self.write(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    /// Deserialize from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(Self::read(&mut std::io::Cursor::new(data))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trip() {
        let record = RestageFileRecord {
            flags: RecordFlags::new().with_bpv7(true).with_is_frag(true),
            src_eid: "ipn:977.12".into(),
            dst_eid: "dtn://alpha.example/mail".into(),
            creation_ts: 745_286_400_123,
            seq_num: 42,
            frag_offset: 1_000,
            frag_length: 2_000,
            orig_payload_length: 4_000,
            exp_seconds: 745_372_800,
            payload: vec![0xAB; 2_000],
        };

        let bytes = record.to_bytes().unwrap();
        assert_eq!(&bytes[..4], b"BRDF");

        let parsed = RestageFileRecord::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, record);
        assert!(parsed.flags.bpv7());
        assert!(parsed.flags.is_frag());
    }

    #[test]
    fn rejects_truncated_record() {
        let record = RestageFileRecord {
            flags: RecordFlags::new(),
            src_eid: "ipn:1.1".into(),
            dst_eid: "ipn:2.1".into(),
            creation_ts: 1,
            seq_num: 2,
            frag_offset: 0,
            frag_length: 0,
            orig_payload_length: 16,
            exp_seconds: 100,
            payload: vec![0u8; 16],
        };

        let bytes = record.to_bytes().unwrap();
        assert!(RestageFileRecord::from_bytes(&bytes[..bytes.len() - 4]).is_err());
        assert!(RestageFileRecord::from_bytes(b"XXXX").is_err());
    }
}
