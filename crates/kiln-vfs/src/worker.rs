use tracing::{debug, warn};

use crate::{ReadCallback, Vfs, VfsFlags, WriteCallback};

/// One queued asynchronous operation. Owned exclusively by the disk worker
/// once dequeued.
pub(crate) enum VfsRequest {
    Read {
        path: String,
        flags: VfsFlags,
        callback: ReadCallback,
    },
    Write {
        path: String,
        flags: VfsFlags,
        data: Vec<u8>,
        callback: WriteCallback,
    },
    Terminate,
}

/// Single-consumer disk worker. Requests complete in submission order; the
/// completion callback runs on this thread.
pub(crate) fn run(vfs: std::sync::Weak<Vfs>, rx: crossbeam_channel::Receiver<VfsRequest>) {
    while let Ok(request) = rx.recv() {
        let Some(vfs) = vfs.upgrade() else { break };
        match request {
            VfsRequest::Read {
                path,
                flags,
                callback,
            } => {
                let blob = match vfs.read(&path, flags) {
                    Ok(blob) => Some(blob),
                    Err(err) => {
                        debug!("async read '{}' failed: {}", path, err);
                        None
                    }
                };
                callback(&path, blob);
            }
            VfsRequest::Write {
                path,
                flags,
                data,
                callback,
            } => {
                let written = match vfs.write(&path, &data, flags) {
                    Ok(written) => written,
                    Err(err) => {
                        warn!("async write '{}' failed: {}", path, err);
                        0
                    }
                };
                callback(&path, written);
            }
            VfsRequest::Terminate => break,
        }
    }
}
