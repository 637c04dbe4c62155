//! External-storage enumeration: the initial scan and the rescan.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{info, warn};

use bard_fname::{parse_dir_name, parse_filename, BundleFileDesc};

use crate::error::{BardError, Result};

use super::controller::{block_rounded, DirStats, RestageController};

/// Walk the storage root and rebuild the in-memory directory map, the
/// per-directory statistics and the status accounting, then publish the
/// per-directory usage to the daemon.
///
/// Used both for the bootstrap scan and for a rescan; during a rescan the
/// daemon has already zeroed the external in-use counters this republishes
/// into.
pub(crate) fn scan_external_storage(ctl: &Arc<RestageController>) -> Result<()> {
    let sep = ctl.separators();
    let root = ctl.params().storage_path.clone();
    let block_size = ctl.status().vol_block_size();

    let mut restage_dirs: BTreeMap<String, BTreeMap<String, BundleFileDesc>> = BTreeMap::new();
    let mut dir_stats: BTreeMap<String, DirStats> = BTreeMap::new();
    let mut grand_files = 0u64;
    let mut grand_bytes = 0u64;

    let entries = std::fs::read_dir(&root)
        .map_err(|e| BardError::io(root.display().to_string(), e))?;

    for entry in entries {
        let entry = entry.map_err(|e| BardError::io(root.display().to_string(), e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let dirname = entry.file_name().to_string_lossy().to_string();
        let (quota_type, scheme, nodename, node_number) = match parse_dir_name(&dirname, sep) {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    "scan: skipping foreign directory {} under {}",
                    dirname,
                    root.display()
                );
                continue;
            }
        };

        let mut files: BTreeMap<String, BundleFileDesc> = BTreeMap::new();
        let mut stats = DirStats {
            quota_type,
            scheme,
            nodename: nodename.clone(),
            node_number,
            num_files: 0,
            total_size: 0,
        };

        let dir_entries = std::fs::read_dir(&path)
            .map_err(|e| BardError::io(path.display().to_string(), e))?;
        for file_entry in dir_entries {
            let file_entry =
                file_entry.map_err(|e| BardError::io(path.display().to_string(), e))?;
            let filename = file_entry.file_name().to_string_lossy().to_string();
            if !file_entry.path().is_file() || filename.ends_with(".part") {
                continue;
            }

            let mut desc = match parse_filename(&filename, sep) {
                Ok(desc) => desc,
                Err(_) => {
                    warn!("scan: skipping foreign file {dirname}/{filename}");
                    continue;
                }
            };

            let meta = match file_entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("scan: unable to stat {dirname}/{filename}: {e}");
                    continue;
                }
            };

            desc.quota_type = quota_type;
            desc.file_size = meta.len();
            desc.disk_usage = block_rounded(meta.len(), block_size);
            desc.file_creation_time = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);

            stats.num_files += 1;
            stats.total_size += desc.disk_usage;
            grand_files += 1;
            grand_bytes += desc.disk_usage;

            files.insert(filename, desc);
        }

        dir_stats.insert(dirname.clone(), stats);
        restage_dirs.insert(dirname, files);
    }

    // install the fresh view, then publish
    {
        let mut state = ctl.state.lock();
        state.restage_dirs = restage_dirs;
        state.dir_stats = dir_stats.clone();
        state.grand_total_num_files = grand_files;
        state.grand_total_num_bytes = grand_bytes;
        state.external_storage_scanned = true;
    }
    ctl.status().set_disk_usage(grand_bytes, grand_files);

    ctl.with_bard(|bard| {
        for stats in dir_stats.values() {
            if stats.num_files > 0 {
                bard.update_restage_usage_stats(
                    stats.quota_type,
                    stats.scheme,
                    &stats.nodename,
                    stats.num_files,
                    stats.total_size,
                );
            }
        }
    });

    info!(
        "restage link {}: scanned {} file(s) occupying {} byte(s) under {}",
        ctl.link_name(),
        grand_files,
        grand_bytes,
        root.display()
    );
    Ok(())
}
