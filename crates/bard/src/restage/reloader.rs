//! The Reloader worker: re-materializes restaged bundles into internal
//! storage, and services delete requests.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use log::{debug, info, warn};

use bard_eid::EndpointId;
use bard_fname::record::RestageFileRecord;
use bard_fname::{parse_dir_name, BundleFileDesc};

use crate::bundle::Bundle;
use crate::dtntime;
use crate::runtime::{interruptible_sleep, StopFlag};

use super::controller::{ReloadEvent, RestageController};

/// Read failures beyond this count quarantine a file: it stays on disk but
/// is skipped by future reloads.
const QUARANTINE_ERRORS: u32 = 3;

pub(crate) fn run_reloader(ctl: Arc<RestageController>, flag: &StopFlag) {
    while !flag.should_stop() {
        if ctl.is_paused() {
            interruptible_sleep(flag, Duration::from_millis(100));
            continue;
        }

        let event = match ctl.reload_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match event {
            ReloadEvent::Reload {
                dirname,
                new_expiration,
                new_dest_eid,
            } => process_reload(&ctl, &dirname, new_expiration, new_dest_eid.as_deref(), flag),
            ReloadEvent::Delete { dirname } => process_delete(&ctl, &dirname, flag),
        }
    }
}

/// Snapshot of the directory's non-quarantined files.
fn dir_snapshot(ctl: &RestageController, dirname: &str) -> Vec<BundleFileDesc> {
    let state = ctl.state.lock();
    state
        .restage_dirs
        .get(dirname)
        .map(|files| {
            files
                .values()
                .filter(|desc| desc.error_count < QUARANTINE_ERRORS)
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

fn process_reload(
    ctl: &Arc<RestageController>,
    dirname: &str,
    new_expiration: u64,
    new_dest_eid: Option<&str>,
    flag: &StopFlag,
) {
    let sep = ctl.separators();
    let Ok((quota_type, scheme, nodename, _node_number)) = parse_dir_name(dirname, sep) else {
        warn!("reloader: unparseable directory name {dirname}");
        return;
    };

    let new_dest = match new_dest_eid.map(EndpointId::parse) {
        None => None,
        Some(Ok(eid)) => Some(eid),
        Some(Err(e)) => {
            warn!("reloader: bad destination EID override: {e}");
            return;
        }
    };

    let mut reloaded = 0usize;
    for desc in dir_snapshot(ctl, dirname) {
        if flag.should_stop() {
            break;
        }

        // reload admission checks internal quota only
        let accepted = ctl
            .with_bard(|bard| {
                bard.query_accept_reload_bundle(
                    quota_type,
                    scheme,
                    &nodename,
                    desc.payload_length,
                )
            })
            .unwrap_or(false);
        if !accepted {
            debug!(
                "reloader: internal quota refuses {} from {dirname} for now",
                desc.filename
            );
            continue;
        }

        let path = ctl.dir_path(dirname).join(&desc.filename);
        let bundle = match read_bundle(&path, new_dest.clone(), new_expiration) {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(
                    "reloader: error reading restaged file {}: {e}",
                    path.display()
                );
                note_read_error(ctl, dirname, &desc.filename);
                continue;
            }
        };

        if let Err(e) = ctl.sink().deliver(bundle) {
            warn!(
                "reloader: inbound path rejected reload of {}: {e}",
                desc.filename
            );
            continue;
        }

        if ctl.delete_tracked_file(dirname, &desc.filename).is_some() {
            ctl.state.lock().totals.reloaded += 1;
            reloaded += 1;
        }
    }

    if reloaded > 0 {
        info!("reloader: reloaded {reloaded} bundle(s) from {dirname}");
        ctl.update_cl_state();
    }
}

fn process_delete(ctl: &Arc<RestageController>, dirname: &str, flag: &StopFlag) {
    let mut deleted = 0usize;
    for desc in dir_snapshot(ctl, dirname) {
        if flag.should_stop() {
            break;
        }
        if ctl.delete_tracked_file(dirname, &desc.filename).is_some() {
            ctl.state.lock().totals.deleted += 1;
            deleted += 1;
        }
    }

    if deleted > 0 {
        info!("reloader: deleted {deleted} restaged bundle(s) from {dirname}");
        ctl.update_cl_state();
    }
}

/// Record a read failure against the live descriptor; at the threshold the
/// file is left in place but skipped from then on.
fn note_read_error(ctl: &RestageController, dirname: &str, filename: &str) {
    let mut state = ctl.state.lock();
    state.totals.errors += 1;
    if let Some(desc) = state
        .restage_dirs
        .get_mut(dirname)
        .and_then(|files| files.get_mut(filename))
    {
        desc.error_count += 1;
        if desc.error_count == QUARANTINE_ERRORS {
            warn!(
                "reloader: quarantining {dirname}/{filename} after {} read errors",
                desc.error_count
            );
        }
    }
}

/// Reconstruct a bundle from a restaged file, applying the optional
/// destination override and minimum-lifetime extension.
fn read_bundle(
    path: &std::path::Path,
    new_dest: Option<EndpointId>,
    new_expiration: u64,
) -> crate::error::Result<Bundle> {
    let bytes =
        std::fs::read(path).map_err(|e| crate::error::BardError::io(path.display().to_string(), e))?;
    let record = RestageFileRecord::from_bytes(&bytes)?;

    let source = EndpointId::parse(&record.src_eid.to_string())?;
    let dest = match new_dest {
        Some(dest) => dest,
        None => EndpointId::parse(&record.dst_eid.to_string())?,
    };

    let mut exp_seconds = record.exp_seconds;
    if new_expiration > 0 {
        exp_seconds = exp_seconds.max(dtntime::now_dtn_secs() + new_expiration);
    }

    let mut bundle = Bundle::new(
        source,
        dest,
        record.creation_ts,
        record.seq_num,
        record.payload.clone(),
        exp_seconds,
    );
    bundle.set_bpv7(record.flags.bpv7());
    if record.flags.is_frag() {
        bundle = bundle.into_fragment(record.frag_offset, record.orig_payload_length);
    }
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bard_fname::record::RecordFlags;

    #[test]
    fn read_bundle_applies_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.brdf");

        let record = RestageFileRecord {
            flags: RecordFlags::new().with_bpv7(true),
            src_eid: "ipn:977.12".into(),
            dst_eid: "ipn:31.6".into(),
            creation_ts: 100,
            seq_num: 5,
            frag_offset: 0,
            frag_length: 0,
            orig_payload_length: 3,
            exp_seconds: 10,
            payload: vec![1, 2, 3],
        };
        std::fs::write(&path, record.to_bytes().unwrap()).unwrap();

        let bundle = read_bundle(
            &path,
            Some(EndpointId::parse("ipn:99.1").unwrap()),
            600,
        )
        .unwrap();

        assert_eq!(bundle.dest().to_string(), "ipn:99.1");
        assert_eq!(bundle.source().to_string(), "ipn:977.12");
        assert_eq!(bundle.payload(), &[1, 2, 3]);
        // lifetime extended to at least now + 600
        assert!(bundle.exp_seconds() >= dtntime::now_dtn_secs() + 599);
    }

    #[test]
    fn read_bundle_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage");
        std::fs::write(&path, b"not a record").unwrap();
        assert!(read_bundle(&path, None, 0).is_err());
    }
}
