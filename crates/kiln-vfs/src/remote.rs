//! Bridges the filesystem onto the remote command bus: `FRD0` (read),
//! `FWT0` (write), and `DMON` (change monitoring).

use std::sync::{Arc, Weak};

use kiln_remote::{
    ClientHandler, CommandDesc, CommandRegistry, RemoteError, RemoteServer, ServerHandler,
    ServerOutcome, CMD_MONITOR_CHANGES, CMD_VFS_READ, CMD_VFS_WRITE,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Vfs, VfsFlags};

#[derive(Serialize, Deserialize)]
struct ReadRequest {
    path: String,
    flags: u32,
}

#[derive(Serialize, Deserialize)]
struct WriteRequest {
    path: String,
    flags: u32,
    data: Vec<u8>,
}

pub(crate) fn encode_read_request(path: &str, flags: VfsFlags) -> Vec<u8> {
    bincode::serialize(&ReadRequest {
        path: path.to_owned(),
        flags: flags.bits(),
    })
    .expect("serialize read request")
}

pub(crate) fn encode_write_request(path: &str, flags: VfsFlags, data: Vec<u8>) -> Vec<u8> {
    bincode::serialize(&WriteRequest {
        path: path.to_owned(),
        flags: flags.bits(),
        data,
    })
    .expect("serialize write request")
}

pub(crate) fn decode_bytes_written(payload: &[u8]) -> u64 {
    bincode::deserialize(payload).unwrap_or(0)
}

/// Registers the filesystem commands on `registry`. `server` supplies the
/// serving half (a filesystem plus the bus endpoint used for deferred
/// responses); `client` supplies the filesystem that issues remote
/// requests. A process acting as both passes both.
pub fn register_commands(
    registry: &CommandRegistry,
    server: Option<(&Arc<Vfs>, &Arc<RemoteServer>)>,
    client: Option<&Arc<Vfs>>,
) -> Result<(), RemoteError> {
    registry.register(CommandDesc {
        command: CMD_VFS_READ,
        server_fn: server.map(|(vfs, srv)| read_server_handler(vfs, srv)),
        client_fn: client.map(completion_handler),
        is_async: true,
    })?;
    registry.register(CommandDesc {
        command: CMD_VFS_WRITE,
        server_fn: server.map(|(vfs, srv)| write_server_handler(vfs, srv)),
        client_fn: client.map(completion_handler),
        is_async: true,
    })?;
    registry.register(CommandDesc {
        command: CMD_MONITOR_CHANGES,
        server_fn: server.map(|(vfs, _)| monitor_server_handler(vfs)),
        client_fn: client.map(monitor_client_handler),
        is_async: false,
    })?;
    Ok(())
}

fn read_server_handler(vfs: &Arc<Vfs>, server: &Arc<RemoteServer>) -> ServerHandler {
    let vfs = Arc::downgrade(vfs);
    let server = Arc::clone(server);
    Arc::new(move |_ctx, payload| {
        let Some(vfs) = vfs.upgrade() else {
            return ServerOutcome::Error("filesystem is gone".to_owned());
        };
        let Ok(request) = bincode::deserialize::<ReadRequest>(payload) else {
            return ServerOutcome::Error("malformed read request".to_owned());
        };

        let server = Arc::clone(&server);
        let flags = VfsFlags::from_bits_truncate(request.flags);
        vfs.read_async(
            &request.path,
            flags,
            Box::new(move |path, blob| {
                let result = match blob {
                    Some(data) => server.send_response(CMD_VFS_READ, data, false, ""),
                    // The failed path travels back as the error description.
                    None => server.send_response(CMD_VFS_READ, Vec::new(), true, path),
                };
                if let Err(err) = result {
                    warn!("read response for '{}' not delivered: {}", path, err);
                }
            }),
        );
        ServerOutcome::Deferred
    })
}

fn write_server_handler(vfs: &Arc<Vfs>, server: &Arc<RemoteServer>) -> ServerHandler {
    let vfs = Arc::downgrade(vfs);
    let server = Arc::clone(server);
    Arc::new(move |_ctx, payload| {
        let Some(vfs) = vfs.upgrade() else {
            return ServerOutcome::Error("filesystem is gone".to_owned());
        };
        let Ok(request) = bincode::deserialize::<WriteRequest>(payload) else {
            return ServerOutcome::Error("malformed write request".to_owned());
        };

        let server = Arc::clone(&server);
        let flags = VfsFlags::from_bits_truncate(request.flags);
        vfs.write_async(
            &request.path,
            request.data,
            flags,
            Box::new(move |path, written| {
                let payload = bincode::serialize(&written).expect("serialize byte count");
                if let Err(err) = server.send_response(CMD_VFS_WRITE, payload, false, "") {
                    warn!("write response for '{}' not delivered: {}", path, err);
                }
            }),
        );
        ServerOutcome::Deferred
    })
}

fn monitor_server_handler(vfs: &Arc<Vfs>) -> ServerHandler {
    let vfs = Arc::downgrade(vfs);
    Arc::new(move |_ctx, _payload| {
        let Some(vfs) = vfs.upgrade() else {
            return ServerOutcome::Error("filesystem is gone".to_owned());
        };
        let changes = vfs.drain_changes();
        let payload = bincode::serialize(&changes).expect("serialize change set");
        ServerOutcome::Response(payload)
    })
}

fn completion_handler(vfs: &Arc<Vfs>) -> ClientHandler {
    let vfs = Arc::downgrade(vfs);
    Arc::new(move |_cmd, payload, user, error| {
        if let Some(vfs) = vfs.upgrade() {
            vfs.complete_remote(user, payload, error);
        }
    })
}

fn monitor_client_handler(vfs: &Arc<Vfs>) -> ClientHandler {
    let vfs: Weak<Vfs> = Arc::downgrade(vfs);
    Arc::new(move |_cmd, payload, _user, error| {
        if error.is_some() {
            return;
        }
        let Some(vfs) = vfs.upgrade() else { return };
        match bincode::deserialize::<Vec<String>>(payload) {
            Ok(changes) if !changes.is_empty() => vfs.dispatch_remote_changes(changes),
            Ok(_) => {}
            Err(err) => warn!("malformed change set: {}", err),
        }
    })
}
