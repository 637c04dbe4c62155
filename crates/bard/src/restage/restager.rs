//! The Restager worker: drains the link queue and writes bundles to
//! external storage.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};

use bard_eid::QuotaType;
use bard_fname::record::{RecordFlags, RestageFileRecord};
use bard_fname::{format_dir_name, format_filename};
use bard_shaper::TokenBucket;

use crate::bundle::Bundle;
use crate::dtntime;
use crate::runtime::{interruptible_sleep, StopFlag};

use super::controller::{block_rounded, RestageController};

pub(crate) fn run_restager(ctl: Arc<RestageController>, flag: &StopFlag) {
    let mut bucket = match ctl.params().write_rate_bps {
        0 => None,
        rate => Some(TokenBucket::new(rate, rate)),
    };

    while !flag.should_stop() {
        if ctl.is_paused() {
            interruptible_sleep(flag, Duration::from_millis(100));
            continue;
        }

        let Some(bundle) = ctl.link().dequeue_timeout(Duration::from_millis(100)) else {
            continue;
        };

        // pause is only honored between bundles, never mid-file
        if let Err(e) = process_bundle(&ctl, &bundle, bucket.as_mut(), flag) {
            ctl.state.lock().totals.errors += 1;
            error!(
                "restage link {}: error restaging bundle {}: {e}",
                ctl.link_name(),
                bundle.id()
            );
            ctl.enter_error_state(&e.to_string());
        }
    }
}

fn process_bundle(
    ctl: &Arc<RestageController>,
    bundle: &Arc<Bundle>,
    bucket: Option<&mut TokenBucket>,
    flag: &StopFlag,
) -> crate::error::Result<()> {
    let sep = ctl.separators();

    let quota_type = if bundle.restage_by_src() {
        QuotaType::Src
    } else {
        QuotaType::Dst
    };
    let eid = bundle.eid_for(quota_type);
    let nodename = eid.node_name();

    let dirname = format_dir_name(quota_type, eid.scheme(), &nodename, sep);
    let mut desc = bundle.to_file_desc(quota_type);
    let filename = format_filename(&desc, sep);
    desc.filename = filename.clone();

    let dir_path = ctl.dir_path(&dirname);
    std::fs::create_dir_all(&dir_path)
        .map_err(|e| crate::error::BardError::io(dir_path.display().to_string(), e))?;

    let record = RestageFileRecord {
        flags: RecordFlags::new()
            .with_bpv7(bundle.is_bpv7())
            .with_is_frag(bundle.is_fragment()),
        src_eid: bundle.source().to_string().into(),
        dst_eid: bundle.dest().to_string().into(),
        creation_ts: bundle.creation_ts(),
        seq_num: bundle.seq_num(),
        frag_offset: bundle.frag_offset(),
        frag_length: if bundle.is_fragment() {
            bundle.payload_len()
        } else {
            0
        },
        orig_payload_length: bundle.orig_payload_len(),
        exp_seconds: bundle.exp_seconds(),
        payload: bundle.payload().to_vec(),
    };
    let bytes = record.to_bytes()?;

    let file_path = dir_path.join(&filename);

    // filename is the uniqueness key: an existing file of the same size is
    // the same bundle, restaged twice
    if let Ok(meta) = std::fs::metadata(&file_path) {
        if meta.len() == bytes.len() as u64 {
            ctl.state.lock().totals.dupes_ignored += 1;
            info!(
                "restage link {}: ignoring duplicate restage of {filename}",
                ctl.link_name()
            );
            return Ok(());
        }
    }

    if let Some(bucket) = bucket {
        throttle_write(bucket, bytes.len() as u64 * 8, flag);
    }

    write_with_retry(&file_path, &bytes)?;

    let file_size = bytes.len() as u64;
    let disk_usage = block_rounded(file_size, ctl.status().vol_block_size());

    desc.file_size = file_size;
    desc.disk_usage = disk_usage;
    desc.file_creation_time = dtntime::now_unix_secs();

    ctl.track_file(&dirname, desc);
    ctl.state.lock().totals.restaged += 1;

    ctl.with_bard(|bard| bard.bundle_restaged(bundle, disk_usage));
    ctl.update_cl_state();

    debug!(
        "restage link {}: restaged bundle {} to {dirname}/{filename} ({disk_usage} bytes of disk)",
        ctl.link_name(),
        bundle.id()
    );
    Ok(())
}

/// Block until the write bucket has tokens for `bits`. A write larger than
/// the bucket depth overdrafts once the bucket is full; the deficit paces
/// the writes that follow.
fn throttle_write(bucket: &mut TokenBucket, bits: u64, flag: &StopFlag) {
    let target = bits.min(bucket.depth());

    while !bucket.try_to_drain(target) {
        if flag.should_stop() {
            return;
        }
        let wait = bucket
            .time_to_level(target as i64)
            .min(Duration::from_millis(10));
        std::thread::sleep(wait.max(Duration::from_micros(1)));
    }

    if bits > target {
        bucket.drain(bits - target, false);
    }
}

/// One retry on a transient write failure, through a temp file so a torn
/// write never shows up under the real name.
fn write_with_retry(path: &Path, bytes: &[u8]) -> crate::error::Result<()> {
    let tmp = path.with_extension("part");

    let mut last_err = None;
    for _attempt in 0..2 {
        match std::fs::write(&tmp, bytes).and_then(|()| std::fs::rename(&tmp, path)) {
            Ok(()) => return Ok(()),
            Err(e) => last_err = Some(e),
        }
    }

    let _ = std::fs::remove_file(&tmp);
    Err(crate::error::BardError::io(
        path.display().to_string(),
        last_err.expect("error set on failure"),
    ))
}
