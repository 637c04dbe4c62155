//! The `bardquota` table: persisted quota fields of a usage record.

use std::sync::Arc;

use binrw::prelude::*;
use binrw::NullString;
use log::error;

use bard_eid::{NamingScheme, QuotaType};

use crate::error::Result;
use crate::usage::UsageRecord;

use super::{DurableStore, TABLE_BARDQUOTA};

/// Serialized form of the quota fields. Identity is repeated inside the
/// record so a table can be rebuilt even if key encoding changes.
#[binrw::binrw]
#[derive(Debug, PartialEq, Eq)]
#[brw(little, magic = b"BRDQ")]
struct QuotaRecordSer {
    #[bw(calc = 1)]
    #[br(assert(_version == 1))]
    _version: u8,

    quota_type: u32,
    naming_scheme: u32,
    node_number: u64,
    nodename: NullString,

    internal_bundles: u64,
    internal_bytes: u64,
    external_bundles: u64,
    external_bytes: u64,

    #[br(map = |v: u8| v != 0)]
    #[bw(map = |v: &bool| u8::from(*v))]
    refuse_bundle: bool,
    #[br(map = |v: u8| v != 0)]
    #[bw(map = |v: &bool| u8::from(*v))]
    auto_reload: bool,

    restage_link_name: NullString,
}

/// Typed access to the quota table of a [`DurableStore`].
#[derive(Clone)]
pub struct QuotaStore {
    store: Arc<dyn DurableStore>,
}

impl QuotaStore {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }

    fn serialize(rec: &UsageRecord) -> Result<Vec<u8>> {
        let ser = QuotaRecordSer {
            quota_type: rec.quota_type().to_int(),
            naming_scheme: rec.naming_scheme().to_int(),
            node_number: rec.node_number(),
            nodename: rec.nodename().into(),
            internal_bundles: rec.quota_internal_bundles(),
            internal_bytes: rec.quota_internal_bytes(),
            external_bundles: rec.quota_external_bundles(),
            external_bytes: rec.quota_external_bytes(),
            refuse_bundle: rec.quota_refuse_bundle(),
            auto_reload: rec.quota_auto_reload(),
            restage_link_name: rec.quota_restage_link_name().into(),
        };

        let mut cursor = std::io::Cursor::new(Vec::new());
        ser.write(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    fn deserialize(bytes: &[u8]) -> Result<UsageRecord> {
        let ser = QuotaRecordSer::read(&mut std::io::Cursor::new(bytes))?;

        let quota_type = QuotaType::from_int(ser.quota_type)?;
        let scheme = NamingScheme::from_int(ser.naming_scheme)?;
        let nodename = ser.nodename.to_string();

        let mut rec = UsageRecord::new(quota_type, scheme, &nodename);
        rec.set_quota_internal_bundles(ser.internal_bundles);
        rec.set_quota_internal_bytes(ser.internal_bytes);
        rec.set_quota_external_bundles(ser.external_bundles);
        rec.set_quota_external_bytes(ser.external_bytes);
        rec.set_quota_refuse_bundle(ser.refuse_bundle);
        rec.set_quota_auto_reload(ser.auto_reload);
        let link = ser.restage_link_name.to_string();
        rec.set_quota_restage_link_name(&link);

        rec.set_quota_modified(false);
        rec.set_quota_in_datastore(true);
        Ok(rec)
    }

    pub fn add(&self, rec: &UsageRecord) -> Result<()> {
        let bytes = Self::serialize(rec)?;
        self.store.add(TABLE_BARDQUOTA, rec.key(), &bytes)
    }

    pub fn update(&self, rec: &UsageRecord) -> Result<()> {
        let bytes = Self::serialize(rec)?;
        self.store.update(TABLE_BARDQUOTA, rec.key(), &bytes)
    }

    pub fn del(&self, key: &str) -> Result<bool> {
        self.store.del(TABLE_BARDQUOTA, key)
    }

    /// Load every stored quota record, skipping (and logging) records that
    /// no longer parse.
    pub fn load_all(&self) -> Result<Vec<UsageRecord>> {
        let mut out = Vec::new();
        for key in self.store.keys(TABLE_BARDQUOTA)? {
            let Some(bytes) = self.store.get(TABLE_BARDQUOTA, &key)? else {
                continue;
            };
            match Self::deserialize(&bytes) {
                Ok(rec) => out.push(rec),
                Err(e) => error!("error loading quota record <{key}> from data store: {e}"),
            }
        }
        Ok(out)
    }
}
