//! The `imcrgngrp` table: persisted IMC region/group records.

use std::sync::Arc;

use binrw::prelude::*;
use log::error;

use crate::error::{BardError, Result};
use crate::imc::{ImcRecKind, ImcRecOperation, ImcRegionGroupRec};

use super::{DurableStore, TABLE_IMCRGNGRP};

#[binrw::binrw]
#[derive(Debug)]
#[brw(little, magic = b"IMCR")]
struct ImcRecordSer {
    #[bw(calc = 1)]
    #[br(assert(_version == 1))]
    _version: u8,

    rec_type: i32,
    region_or_group_num: u64,
    node_or_id_num: u64,
    operation: u32,
    #[br(map = |v: u8| v != 0)]
    #[bw(map = |v: &bool| u8::from(*v))]
    is_router_node: bool,
}

/// Typed access to the IMC record table of a [`DurableStore`].
#[derive(Clone)]
pub struct ImcRecStore {
    store: Arc<dyn DurableStore>,
}

impl ImcRecStore {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    fn serialize(rec: &ImcRegionGroupRec) -> Result<Vec<u8>> {
        let ser = ImcRecordSer {
            rec_type: rec.kind.to_int(),
            region_or_group_num: rec.region_or_group_num,
            node_or_id_num: rec.node_or_id_num,
            operation: rec.operation.to_int(),
            is_router_node: rec.is_router_node,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        ser.write(&mut cursor)?;
        Ok(cursor.into_inner())
    }

    fn deserialize(key: &str, bytes: &[u8]) -> Result<ImcRegionGroupRec> {
        let ser = ImcRecordSer::read(&mut std::io::Cursor::new(bytes))?;
        let kind = ImcRecKind::from_int(ser.rec_type)
            .ok_or_else(|| BardError::Other(format!("bad IMC rec type in record <{key}>")))?;
        let operation = ImcRecOperation::from_int(ser.operation)
            .ok_or_else(|| BardError::Other(format!("bad IMC operation in record <{key}>")))?;

        Ok(ImcRegionGroupRec {
            kind,
            region_or_group_num: ser.region_or_group_num,
            node_or_id_num: ser.node_or_id_num,
            operation,
            is_router_node: ser.is_router_node,
            in_datastore: true,
        })
    }

    /// Insert or replace a record inside a transaction, marking it stored.
    pub fn save(&self, rec: &mut ImcRegionGroupRec) -> Result<()> {
        let bytes = Self::serialize(rec)?;
        let key = rec.durable_key();

        self.store.begin_transaction();
        let result = if rec.in_datastore {
            self.store.update(TABLE_IMCRGNGRP, &key, &bytes)
        } else {
            match self.store.add(TABLE_IMCRGNGRP, &key, &bytes) {
                Err(BardError::StoreKeyExists(_)) => {
                    self.store.update(TABLE_IMCRGNGRP, &key, &bytes)
                }
                other => other,
            }
        };
        self.store.end_transaction();

        result?;
        rec.in_datastore = true;
        Ok(())
    }

    pub fn del(&self, key: &str) -> Result<bool> {
        self.store.begin_transaction();
        let result = self.store.del(TABLE_IMCRGNGRP, key);
        self.store.end_transaction();
        result
    }

    /// Delete every record of one class.
    pub fn clear_kind(&self, kind: ImcRecKind) -> Result<usize> {
        let prefix = format!("{}_", kind.to_int());
        let mut removed = 0;

        self.store.begin_transaction();
        for key in self.store.keys(TABLE_IMCRGNGRP)? {
            if key.starts_with(&prefix) && self.store.del(TABLE_IMCRGNGRP, &key)? {
                removed += 1;
            }
        }
        self.store.end_transaction();
        Ok(removed)
    }

    pub fn load_all(&self) -> Result<Vec<ImcRegionGroupRec>> {
        let mut out = Vec::new();
        for key in self.store.keys(TABLE_IMCRGNGRP)? {
            let Some(bytes) = self.store.get(TABLE_IMCRGNGRP, &key)? else {
                continue;
            };
            match Self::deserialize(&key, &bytes) {
                Ok(rec) => out.push(rec),
                Err(e) => error!("error loading IMC record <{key}> from data store: {e}"),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    #[test]
    fn save_and_reload() {
        let store = ImcRecStore::new(Arc::new(MemStore::new()));

        let mut rec = ImcRegionGroupRec::new(ImcRecKind::Region, 4, 977);
        rec.operation = ImcRecOperation::Add;
        rec.is_router_node = true;
        store.save(&mut rec).unwrap();
        assert!(rec.in_datastore);

        // saving again updates in place
        rec.is_router_node = false;
        store.save(&mut rec).unwrap();

        let recs = store.load_all().unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].kind, ImcRecKind::Region);
        assert!(!recs[0].is_router_node);
    }

    #[test]
    fn clear_kind_only_touches_one_class() {
        let store = ImcRecStore::new(Arc::new(MemStore::new()));
        store
            .save(&mut ImcRegionGroupRec::new(ImcRecKind::Region, 4, 1))
            .unwrap();
        store
            .save(&mut ImcRegionGroupRec::new(ImcRecKind::Group, 9, 1))
            .unwrap();

        assert_eq!(store.clear_kind(ImcRecKind::Region).unwrap(), 1);
        let recs = store.load_all().unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].kind, ImcRecKind::Group);
    }
}
