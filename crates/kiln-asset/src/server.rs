//! Bake-server mode: remote bake requests accumulate in a pending queue
//! and are answered in batches by the scheduler's Server jobs.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use kiln_remote::{FourCC, RemoteServer};
use tracing::{error, warn};
use xxhash_rust::xxh32::xxh32;

use crate::{
    params::AssetParams,
    pipeline::{bake_or_fetch, PipelineShared},
    remote::encode_reply_head,
    AssetError,
};

/// One queued remote bake request, remembered with the command it arrived
/// on so the reply correlates.
pub(crate) struct BakeRequest {
    pub command: FourCC,
    pub params: AssetParams,
}

/// Pending list of remote bake requests.
#[derive(Default)]
pub(crate) struct BakeQueue {
    pending: Mutex<VecDeque<BakeRequest>>,
}

impl BakeQueue {
    pub(crate) fn push(&self, request: BakeRequest) {
        self.pending.lock().unwrap().push_back(request);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }

    fn pop_up_to(&self, limit: usize) -> Vec<BakeRequest> {
        let mut pending = self.pending.lock().unwrap();
        let count = pending.len().min(limit);
        pending.drain(..count).collect()
    }
}

/// One Server job: pop up to `max_in_flight` requests, run the regular
/// baker path for each in parallel, and stream the results back. Replies
/// go out in arrival order per command so correlation holds.
pub(crate) async fn run_server_job(
    shared: Arc<PipelineShared>,
    queue: Arc<BakeQueue>,
    endpoint: Arc<RemoteServer>,
    max_in_flight: usize,
) {
    let batch = queue.pop_up_to(max_in_flight);
    if batch.is_empty() {
        return;
    }

    let results = futures::future::join_all(batch.into_iter().map(|request| {
        let shared = Arc::clone(&shared);
        async move {
            let outcome = bake_for_peer(shared, request.params).await;
            (request.command, outcome)
        }
    }))
    .await;

    for (command, outcome) in results {
        match outcome {
            Ok((asset_hash, payload)) => {
                let head = encode_reply_head(asset_hash, payload.len() as u32);
                let checksum = xxh32(&payload, 0).to_le_bytes().to_vec();
                // Header and body stitch into one frame without a copy of
                // the baked blob.
                if let Err(err) =
                    endpoint.send_response_merge(command, head, vec![payload, checksum], false, "")
                {
                    warn!("bake reply not delivered: {}", err);
                }
            }
            Err(err) => {
                error!("remote bake failed: {}", err);
                let _ = endpoint.send_response(command, Vec::new(), true, &err.to_string());
            }
        }
    }
}

async fn bake_for_peer(
    shared: Arc<PipelineShared>,
    params: AssetParams,
) -> Result<(u32, Vec<u8>), AssetError> {
    let (type_name, baker, tombstoned) = {
        let types = shared.types.read().unwrap();
        let Some((desc, tombstoned)) = types.get_any(params.type_id) else {
            return Err(AssetError::UnknownType(params.type_id));
        };
        (desc.name.clone(), Arc::clone(&desc.baker), tombstoned)
    };
    if tombstoned {
        return Err(AssetError::BakeFailure {
            path: params.path,
            message: "asset type was unregistered".to_owned(),
        });
    }

    let worker_shared = Arc::clone(&shared);
    let baked = tokio::task::spawn_blocking(move || {
        bake_or_fetch(&worker_shared, &params, &type_name, baker.as_ref()).map(|baked| {
            if baked.needs_persist {
                let cache_path =
                    worker_shared
                        .cache
                        .cache_path(&params.path, baked.asset_hash, &type_name);
                worker_shared
                    .cache
                    .write_entry_async(&worker_shared.vfs, &cache_path, &baked.payload);
                worker_shared
                    .cache
                    .update_lookup(params.params_hash(), baked.asset_hash);
            }
            (baked.asset_hash, baked.payload)
        })
    })
    .await
    .map_err(|join_err| AssetError::Serialization(format!("bake task failed: {}", join_err)))??;

    Ok(baked)
}
