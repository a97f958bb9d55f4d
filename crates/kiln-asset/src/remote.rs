//! Bake offload over the command bus: `LDAS` (and the legacy `CSHD`)
//! requests carry load parameters to a bake server; the reply streams the
//! asset hash and a complete cache entry back.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use kiln_remote::{
    ClientHandler, CommandDesc, CommandRegistry, FourCC, RemoteClient, RemoteServer, ServerHandler,
    ServerOutcome, CMD_COMPILE_SHADER, CMD_LOAD_ASSET,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    cache,
    manager::AssetManager,
    params::{AssetParams, AssetPlatform},
    AssetError,
};

/// Wire form of a bake request.
#[derive(Serialize, Deserialize)]
pub(crate) struct LoadAssetRequest {
    pub path: String,
    pub type_id: u32,
    pub platform: AssetPlatform,
    pub extra: Vec<u8>,
}

impl LoadAssetRequest {
    pub(crate) fn from_params(params: &AssetParams) -> Self {
        Self {
            path: params.path.clone(),
            type_id: params.type_id,
            platform: params.platform,
            extra: params.extra.clone(),
        }
    }

    pub(crate) fn into_params(self) -> AssetParams {
        AssetParams {
            type_id: self.type_id,
            path: self.path,
            platform: self.platform,
            extra: self.extra,
            dont_create_resources: false,
        }
    }
}

/// `(asset hash, full cache entry bytes)` on success, short message
/// otherwise.
pub(crate) type BakeReply = Result<(u32, Vec<u8>), String>;

pub(crate) type BakePendingMap = Arc<Mutex<HashMap<u64, tokio::sync::oneshot::Sender<BakeReply>>>>;

/// Reply head: the asset hash followed by the cache entry header. The
/// record payload and its checksum are merged after it on the wire, so the
/// bytes after the hash are a byte-exact cache entry.
pub(crate) fn encode_reply_head(asset_hash: u32, payload_len: u32) -> Vec<u8> {
    let mut head = asset_hash.to_le_bytes().to_vec();
    head.extend_from_slice(&cache::encode_entry_header(payload_len));
    head
}

pub(crate) fn decode_reply(payload: &[u8]) -> BakeReply {
    if payload.len() < 4 {
        return Err("short bake reply".to_owned());
    }
    let asset_hash = u32::from_le_bytes(payload[..4].try_into().expect("length checked"));
    Ok((asset_hash, payload[4..].to_vec()))
}

/// Client half used by the load pipeline to offload bakes.
#[derive(Clone)]
pub(crate) struct BakeClient {
    client: RemoteClient,
    pending: BakePendingMap,
    next_cookie: Arc<AtomicU64>,
}

impl BakeClient {
    pub(crate) fn new(client: RemoteClient, pending: BakePendingMap) -> Self {
        Self {
            client,
            pending,
            next_cookie: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Sends a bake request; the returned receiver resolves when the
    /// server replies or the connection drops.
    pub(crate) fn request(
        &self,
        params: &AssetParams,
    ) -> Result<tokio::sync::oneshot::Receiver<BakeReply>, AssetError> {
        let cookie = self.next_cookie.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.pending.lock().unwrap().insert(cookie, tx);

        let payload = bincode::serialize(&LoadAssetRequest::from_params(params))
            .expect("serialize bake request");
        if let Err(err) = self.client.execute_command(CMD_LOAD_ASSET, payload, cookie) {
            self.pending.lock().unwrap().remove(&cookie);
            return Err(AssetError::RemoteDisconnect(err.to_string()));
        }
        Ok(rx)
    }
}

/// Registers the bake commands on `registry`. The `server` half enqueues
/// incoming requests on its manager's bake queue (answered by the
/// scheduler's Server jobs); the `client` half resolves replies into the
/// pipeline's per-task signals. A process acting as both passes both.
pub fn register_bake_commands(
    registry: &CommandRegistry,
    server: Option<(&Arc<AssetManager>, &Arc<RemoteServer>)>,
    client: Option<&Arc<AssetManager>>,
) -> Result<(), AssetError> {
    if let Some((manager, endpoint)) = server {
        manager.set_bake_endpoint(Arc::clone(endpoint));
    }

    for command in [CMD_LOAD_ASSET, CMD_COMPILE_SHADER] {
        registry.register(CommandDesc {
            command,
            server_fn: server.map(|(manager, _)| bake_server_handler(manager)),
            client_fn: client.map(bake_client_handler),
            is_async: true,
        })?;
    }
    Ok(())
}

fn bake_server_handler(manager: &Arc<AssetManager>) -> ServerHandler {
    let manager = Arc::downgrade(manager);
    Arc::new(move |ctx, payload| {
        let Some(manager) = manager.upgrade() else {
            return ServerOutcome::Error("asset manager is gone".to_owned());
        };
        let Ok(request) = bincode::deserialize::<LoadAssetRequest>(payload) else {
            return ServerOutcome::Error("malformed bake request".to_owned());
        };
        manager.enqueue_bake(ctx.command, request.into_params());
        ServerOutcome::Deferred
    })
}

fn bake_client_handler(manager: &Arc<AssetManager>) -> ClientHandler {
    let pending = manager.bake_pending();
    Arc::new(move |_cmd: FourCC, payload, user, error| {
        let Some(tx) = pending.lock().unwrap().remove(&user) else {
            warn!("bake reply with unknown cookie {}", user);
            return;
        };
        let reply = match error {
            Some(desc) => Err(desc.to_owned()),
            None => decode_reply(payload),
        };
        let _ = tx.send(reply);
    })
}
