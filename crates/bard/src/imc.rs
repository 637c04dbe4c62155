//! IMC region and group override records.
//!
//! Multicast (`imc`) routing is configured through small durable records:
//! the node's home region, per-region membership overrides, per-group
//! subscription overrides, and manual-join entries that force bundles for a
//! group to be retained for delivery. Database-clear tombstones let a
//! startup configuration wipe a record class once without wiping it again
//! on every restart.

use std::collections::BTreeMap;
use std::sync::Mutex;

use log::{info, warn};

use crate::error::Result;
use crate::store::ImcRecStore;

/// Record classes, with the numeric codes used in key strings and the
/// durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImcRecKind {
    Region,
    Group,
    ManualJoin,
    RegionDbClear,
    GroupDbClear,
    ManualJoinDbClear,
    HomeRegion,
}

impl ImcRecKind {
    pub fn to_int(self) -> i32 {
        match self {
            ImcRecKind::Region => 1,
            ImcRecKind::Group => 2,
            ImcRecKind::ManualJoin => 3,
            ImcRecKind::RegionDbClear => -1,
            ImcRecKind::GroupDbClear => -2,
            ImcRecKind::ManualJoinDbClear => -3,
            ImcRecKind::HomeRegion => -999,
        }
    }

    pub fn from_int(v: i32) -> Option<Self> {
        match v {
            1 => Some(ImcRecKind::Region),
            2 => Some(ImcRecKind::Group),
            3 => Some(ImcRecKind::ManualJoin),
            -1 => Some(ImcRecKind::RegionDbClear),
            -2 => Some(ImcRecKind::GroupDbClear),
            -3 => Some(ImcRecKind::ManualJoinDbClear),
            -999 => Some(ImcRecKind::HomeRegion),
            _ => None,
        }
    }

    /// The tombstone kind that governs clearing this record class.
    fn clear_kind(self) -> Option<ImcRecKind> {
        match self {
            ImcRecKind::Region => Some(ImcRecKind::RegionDbClear),
            ImcRecKind::Group => Some(ImcRecKind::GroupDbClear),
            ImcRecKind::ManualJoin => Some(ImcRecKind::ManualJoinDbClear),
            _ => None,
        }
    }
}

/// Whether an override adds or removes the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImcRecOperation {
    Add,
    Remove,
}

impl ImcRecOperation {
    pub fn to_int(self) -> u32 {
        match self {
            ImcRecOperation::Add => 1,
            ImcRecOperation::Remove => 2,
        }
    }

    pub fn from_int(v: u32) -> Option<Self> {
        match v {
            1 => Some(ImcRecOperation::Add),
            2 => Some(ImcRecOperation::Remove),
            _ => None,
        }
    }
}

/// One IMC region/group record.
///
/// For region and group records `region_or_group_num`/`node_or_id_num` are
/// the region (or group) and node numbers. For manual joins they are the
/// group and service numbers of the destination EID. For clear tombstones
/// `node_or_id_num` holds the last-used clear counter. For the home-region
/// record `region_or_group_num` is the home region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImcRegionGroupRec {
    pub kind: ImcRecKind,
    pub region_or_group_num: u64,
    pub node_or_id_num: u64,
    pub operation: ImcRecOperation,
    pub is_router_node: bool,
    pub in_datastore: bool,
}

impl ImcRegionGroupRec {
    pub fn new(kind: ImcRecKind, region_or_group_num: u64, node_or_id_num: u64) -> Self {
        Self {
            kind,
            region_or_group_num,
            node_or_id_num,
            operation: ImcRecOperation::Add,
            is_router_node: false,
            in_datastore: false,
        }
    }

    /// The durable-store key for this record.
    pub fn durable_key(&self) -> String {
        match self.kind {
            ImcRecKind::Region | ImcRecKind::Group | ImcRecKind::ManualJoin => format!(
                "{}_{}_{}",
                self.kind.to_int(),
                self.region_or_group_num,
                self.node_or_id_num
            ),
            ImcRecKind::HomeRegion => "home_region".to_string(),
            ImcRecKind::RegionDbClear => "clear_region_db".to_string(),
            ImcRecKind::GroupDbClear => "clear_group_db".to_string(),
            ImcRecKind::ManualJoinDbClear => "clear_manual_join_db".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct ImcState {
    home_region: Option<u64>,
    /// region -> node -> rec
    regions: BTreeMap<u64, BTreeMap<u64, ImcRegionGroupRec>>,
    /// group -> node -> rec
    groups: BTreeMap<u64, BTreeMap<u64, ImcRegionGroupRec>>,
    /// (group, service) -> rec
    manual_joins: BTreeMap<(u64, u64), ImcRegionGroupRec>,
    /// last clear counter per clearable class
    clear_counters: BTreeMap<i32, u64>,
}

/// The in-memory registry of IMC overrides, mirrored to the durable store.
pub struct ImcRegistry {
    store: ImcRecStore,
    state: Mutex<ImcState>,
}

impl ImcRegistry {
    pub fn new(store: ImcRecStore) -> Self {
        Self {
            store,
            state: Mutex::new(ImcState::default()),
        }
    }

    /// Load every stored record into the in-memory maps.
    pub fn load(&self) -> Result<()> {
        let recs = self.store.load_all()?;
        let mut state = self.state.lock().unwrap();
        let mut count = 0usize;
        for rec in recs {
            count += 1;
            match rec.kind {
                ImcRecKind::HomeRegion => state.home_region = Some(rec.region_or_group_num),
                ImcRecKind::Region => {
                    state
                        .regions
                        .entry(rec.region_or_group_num)
                        .or_default()
                        .insert(rec.node_or_id_num, rec);
                }
                ImcRecKind::Group => {
                    state
                        .groups
                        .entry(rec.region_or_group_num)
                        .or_default()
                        .insert(rec.node_or_id_num, rec);
                }
                ImcRecKind::ManualJoin => {
                    state
                        .manual_joins
                        .insert((rec.region_or_group_num, rec.node_or_id_num), rec);
                }
                ImcRecKind::RegionDbClear
                | ImcRecKind::GroupDbClear
                | ImcRecKind::ManualJoinDbClear => {
                    state
                        .clear_counters
                        .insert(rec.kind.to_int(), rec.node_or_id_num);
                }
            }
        }
        info!("loaded {count} IMC region/group records from data store");
        Ok(())
    }

    pub fn home_region(&self) -> Option<u64> {
        self.state.lock().unwrap().home_region
    }

    pub fn set_home_region(&self, region: u64) -> Result<()> {
        let mut rec = ImcRegionGroupRec::new(ImcRecKind::HomeRegion, region, 0);
        self.store.save(&mut rec)?;
        self.state.lock().unwrap().home_region = Some(region);
        Ok(())
    }

    /// Install a region membership override.
    pub fn apply_region(
        &self,
        region: u64,
        node: u64,
        operation: ImcRecOperation,
        is_router_node: bool,
    ) -> Result<()> {
        let mut rec = ImcRegionGroupRec::new(ImcRecKind::Region, region, node);
        rec.operation = operation;
        rec.is_router_node = is_router_node;
        self.store.save(&mut rec)?;
        self.state
            .lock()
            .unwrap()
            .regions
            .entry(region)
            .or_default()
            .insert(node, rec);
        Ok(())
    }

    /// Install a group subscription override.
    pub fn apply_group(
        &self,
        group: u64,
        node: u64,
        operation: ImcRecOperation,
        is_router_node: bool,
    ) -> Result<()> {
        let mut rec = ImcRegionGroupRec::new(ImcRecKind::Group, group, node);
        rec.operation = operation;
        rec.is_router_node = is_router_node;
        self.store.save(&mut rec)?;
        self.state
            .lock()
            .unwrap()
            .groups
            .entry(group)
            .or_default()
            .insert(node, rec);
        Ok(())
    }

    /// Record a manual join: bundles for (group, service) must be retained
    /// for delivery even without a local registration.
    pub fn add_manual_join(&self, group: u64, service: u64) -> Result<()> {
        let mut rec = ImcRegionGroupRec::new(ImcRecKind::ManualJoin, group, service);
        self.store.save(&mut rec)?;
        self.state
            .lock()
            .unwrap()
            .manual_joins
            .insert((group, service), rec);
        Ok(())
    }

    pub fn remove_manual_join(&self, group: u64, service: u64) -> Result<bool> {
        let rec = ImcRegionGroupRec::new(ImcRecKind::ManualJoin, group, service);
        let existed = self.store.del(&rec.durable_key())?;
        self.state
            .lock()
            .unwrap()
            .manual_joins
            .remove(&(group, service));
        Ok(existed)
    }

    pub fn is_node_in_region(&self, region: u64, node: u64) -> bool {
        let state = self.state.lock().unwrap();
        state
            .regions
            .get(&region)
            .and_then(|m| m.get(&node))
            .is_some_and(|rec| rec.operation == ImcRecOperation::Add)
    }

    pub fn is_node_in_group(&self, group: u64, node: u64) -> bool {
        let state = self.state.lock().unwrap();
        state
            .groups
            .get(&group)
            .and_then(|m| m.get(&node))
            .is_some_and(|rec| rec.operation == ImcRecOperation::Add)
    }

    pub fn group_members(&self, group: u64) -> Vec<u64> {
        let state = self.state.lock().unwrap();
        state
            .groups
            .get(&group)
            .map(|m| {
                m.iter()
                    .filter(|(_, rec)| rec.operation == ImcRecOperation::Add)
                    .map(|(node, _)| *node)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_manual_join(&self, group: u64, service: u64) -> bool {
        self.state
            .lock()
            .unwrap()
            .manual_joins
            .contains_key(&(group, service))
    }

    /// Clear every record of a class, at most once per clear counter.
    ///
    /// A startup configuration passes a fixed counter; the first run clears
    /// the table and stores the counter in a tombstone, later runs with the
    /// same counter are no-ops so console updates are retained.
    pub fn clear_db_once(&self, kind: ImcRecKind, counter: u64) -> Result<bool> {
        let Some(clear_kind) = kind.clear_kind() else {
            warn!("clear_db_once called for non-clearable rec kind {kind:?}");
            return Ok(false);
        };

        {
            let state = self.state.lock().unwrap();
            let last = state
                .clear_counters
                .get(&clear_kind.to_int())
                .copied()
                .unwrap_or(0);
            if counter <= last {
                return Ok(false);
            }
        }

        self.store.clear_kind(kind)?;

        let mut tombstone = ImcRegionGroupRec::new(clear_kind, 0, counter);
        self.store.save(&mut tombstone)?;

        let mut state = self.state.lock().unwrap();
        match kind {
            ImcRecKind::Region => state.regions.clear(),
            ImcRecKind::Group => state.groups.clear(),
            ImcRecKind::ManualJoin => state.manual_joins.clear(),
            _ => {}
        }
        state.clear_counters.insert(clear_kind.to_int(), counter);

        info!("cleared IMC {kind:?} records (clear counter {counter})");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use std::sync::Arc;

    fn registry() -> ImcRegistry {
        ImcRegistry::new(ImcRecStore::new(Arc::new(MemStore::new())))
    }

    #[test]
    fn key_strings_match_the_schema() {
        assert_eq!(
            ImcRegionGroupRec::new(ImcRecKind::Region, 4, 977).durable_key(),
            "1_4_977"
        );
        assert_eq!(
            ImcRegionGroupRec::new(ImcRecKind::Group, 9, 31).durable_key(),
            "2_9_31"
        );
        assert_eq!(
            ImcRegionGroupRec::new(ImcRecKind::ManualJoin, 9, 6).durable_key(),
            "3_9_6"
        );
        assert_eq!(
            ImcRegionGroupRec::new(ImcRecKind::HomeRegion, 4, 0).durable_key(),
            "home_region"
        );
        assert_eq!(
            ImcRegionGroupRec::new(ImcRecKind::RegionDbClear, 0, 3).durable_key(),
            "clear_region_db"
        );
    }

    #[test]
    fn membership_overrides() {
        let reg = registry();
        reg.apply_region(4, 977, ImcRecOperation::Add, true).unwrap();
        reg.apply_region(4, 31, ImcRecOperation::Remove, false)
            .unwrap();

        assert!(reg.is_node_in_region(4, 977));
        assert!(!reg.is_node_in_region(4, 31));
        assert!(!reg.is_node_in_region(5, 977));

        reg.apply_group(9, 31, ImcRecOperation::Add, false).unwrap();
        reg.apply_group(9, 55, ImcRecOperation::Add, false).unwrap();
        reg.apply_group(9, 55, ImcRecOperation::Remove, false)
            .unwrap();
        assert_eq!(reg.group_members(9), vec![31]);
    }

    #[test]
    fn manual_joins_round_trip() {
        let reg = registry();
        reg.add_manual_join(9, 6).unwrap();
        assert!(reg.is_manual_join(9, 6));
        assert!(reg.remove_manual_join(9, 6).unwrap());
        assert!(!reg.is_manual_join(9, 6));
        assert!(!reg.remove_manual_join(9, 6).unwrap());
    }

    #[test]
    fn clear_db_runs_once_per_counter() {
        let reg = registry();
        reg.apply_group(9, 31, ImcRecOperation::Add, false).unwrap();

        assert!(reg.clear_db_once(ImcRecKind::Group, 1).unwrap());
        assert!(reg.group_members(9).is_empty());

        reg.apply_group(9, 55, ImcRecOperation::Add, false).unwrap();
        // same counter: retained
        assert!(!reg.clear_db_once(ImcRecKind::Group, 1).unwrap());
        assert_eq!(reg.group_members(9), vec![55]);

        // higher counter: cleared again
        assert!(reg.clear_db_once(ImcRecKind::Group, 2).unwrap());
        assert!(reg.group_members(9).is_empty());
    }

    #[test]
    fn registry_reloads_from_store() {
        let store = Arc::new(MemStore::new());
        {
            let reg = ImcRegistry::new(ImcRecStore::new(store.clone()));
            reg.set_home_region(4).unwrap();
            reg.apply_region(4, 977, ImcRecOperation::Add, true).unwrap();
            reg.add_manual_join(9, 6).unwrap();
        }

        let reg = ImcRegistry::new(ImcRecStore::new(store));
        reg.load().unwrap();
        assert_eq!(reg.home_region(), Some(4));
        assert!(reg.is_node_in_region(4, 977));
        assert!(reg.is_manual_join(9, 6));
    }
}
