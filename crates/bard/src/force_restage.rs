//! The force-restage sweep: move over-quota bundles to external storage on
//! operator command.

use std::sync::Arc;

use log::{info, warn};

use bard_eid::{EndpointId, NamingScheme, QuotaType};

use crate::bundle::Bundle;
use crate::daemon::Bard;

/// Spawn the sweep thread. It walks the pending bundles newest first,
/// tagging matches with the restage link until both the bundle and byte
/// targets are met. The thread is detached and self-terminating.
#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn_force_restage(
    bard: Arc<Bard>,
    quota_type: QuotaType,
    scheme: NamingScheme,
    nodename: String,
    node_number: u64,
    bundles_to_restage: u64,
    bytes_to_restage: u64,
    restage_link_name: String,
) {
    let result = std::thread::Builder::new()
        .name("force-restage".to_string())
        .spawn(move || {
            sweep(
                &bard,
                quota_type,
                scheme,
                &nodename,
                node_number,
                bundles_to_restage,
                bytes_to_restage,
                &restage_link_name,
            );
        });
    if let Err(e) = result {
        warn!("unable to spawn force-restage thread: {e}");
    }
}

#[allow(clippy::too_many_arguments)]
fn sweep(
    bard: &Arc<Bard>,
    quota_type: QuotaType,
    scheme: NamingScheme,
    nodename: &str,
    node_number: u64,
    bundles_to_restage: u64,
    bytes_to_restage: u64,
    restage_link_name: &str,
) {
    let Some(link) = bard.restage_link(restage_link_name) else {
        warn!("force restage: restage link {restage_link_name} is not registered");
        return;
    };

    let pending = bard.pending();

    let mut num_restaged = 0u64;
    let mut bytes_restaged = 0u64;
    let mut bundles_processed = 0u64;

    let mut cursor = u64::MAX;
    while num_restaged < bundles_to_restage || bytes_restaged < bytes_to_restage {
        let Some(bundle) = pending.find_prev(cursor) else {
            break;
        };
        cursor = bundle.id();
        bundles_processed += 1;

        if !matches_key(&bundle, quota_type, scheme, nodename, node_number) {
            continue;
        }

        bundle.set_restage_by_src(quota_type.is_src());
        bundle.set_restage_link_name(restage_link_name);

        if link.enqueue(bundle.clone()).is_err() {
            warn!("force restage: link {restage_link_name} queue is gone, stopping sweep");
            break;
        }

        num_restaged += 1;
        bytes_restaged += bundle.payload_len();
    }

    info!(
        "force restage {} {} {} - processed: {bundles_processed}  \
         queued: {num_restaged} bundle(s) with {bytes_restaged} byte(s)",
        quota_type, scheme, nodename
    );
}

fn matches_key(
    bundle: &Bundle,
    quota_type: QuotaType,
    scheme: NamingScheme,
    nodename: &str,
    node_number: u64,
) -> bool {
    let eid = bundle.eid_for(quota_type);
    if eid.scheme() != scheme {
        return false;
    }
    match eid {
        EndpointId::Ipn { node, .. } => *node == node_number,
        EndpointId::Imc { group, .. } => *group == node_number,
        EndpointId::Dtn { ssp } => ssp == nodename,
    }
}
