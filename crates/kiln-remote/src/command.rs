use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::RemoteError;

/// 32-bit command code, packed little-endian from a 4-byte tag.
pub type FourCC = u32;

/// Packs a 4-byte tag into a [`FourCC`] code.
pub const fn four_cc(tag: &[u8; 4]) -> FourCC {
    u32::from_le_bytes(*tag)
}

/// Load asset (client → server; async server response).
pub const CMD_LOAD_ASSET: FourCC = four_cc(b"LDAS");
/// Virtual filesystem read.
pub const CMD_VFS_READ: FourCC = four_cc(b"FRD0");
/// Virtual filesystem write.
pub const CMD_VFS_WRITE: FourCC = four_cc(b"FWT0");
/// Drain accumulated file-change events (client polls each second).
pub const CMD_MONITOR_CHANGES: FourCC = four_cc(b"DMON");
/// Legacy shader compile, served by the same bake queue as `CMD_LOAD_ASSET`.
pub const CMD_COMPILE_SHADER: FourCC = four_cc(b"CSHD");

/// Identity of an in-flight request, passed to server handlers.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    /// The command code of the request.
    pub command: FourCC,
    /// Opaque correlation cookie written by the client, echoed in the reply.
    pub cookie: u64,
}

/// What a server handler produced for a request.
pub enum ServerOutcome {
    /// Immediate response with the given payload.
    Response(Vec<u8>),
    /// Handler failed; the description travels back in the error slot.
    Error(String),
    /// Work was scheduled; the reply will arrive later through
    /// [`crate::RemoteServer::send_response`]. Only legal for commands
    /// registered with `is_async`.
    Deferred,
}

/// Server-side handler. Called from a connection task; implementations must
/// keep their shared state thread-safe.
pub type ServerHandler = Arc<dyn Fn(&RequestContext, &[u8]) -> ServerOutcome + Send + Sync>;

/// Client-side completion, invoked once per finished request with
/// `(command, payload, user cookie, error description)`.
pub type ClientHandler = Arc<dyn Fn(FourCC, &[u8], u64, Option<&str>) + Send + Sync>;

/// A registered command: code, the two handler halves, and whether the
/// server defers its response.
#[derive(Clone)]
pub struct CommandDesc {
    /// Command code.
    pub command: FourCC,
    /// Server-side handler, if this end serves the command.
    pub server_fn: Option<ServerHandler>,
    /// Client-side completion, if this end issues the command.
    pub client_fn: Option<ClientHandler>,
    /// Server replies later via `send_response` instead of returning a
    /// payload from the handler.
    pub is_async: bool,
}

struct RegistryInner {
    commands: Vec<CommandDesc>,
    index: HashMap<FourCC, usize>,
}

/// Insertion-ordered table of command descriptors, shared by the server and
/// client halves of a process.
pub struct CommandRegistry {
    inner: RwLock<RegistryInner>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                commands: Vec::new(),
                index: HashMap::new(),
            }),
        }
    }

    /// Registers a command. Registering the same code twice is an error.
    pub fn register(&self, desc: CommandDesc) -> Result<(), RemoteError> {
        let mut inner = self.inner.write().unwrap();
        if inner.index.contains_key(&desc.command) {
            return Err(RemoteError::DuplicateCommand(desc.command));
        }
        let slot = inner.commands.len();
        inner.index.insert(desc.command, slot);
        inner.commands.push(desc);
        Ok(())
    }

    pub(crate) fn find(&self, command: FourCC) -> Option<CommandDesc> {
        let inner = self.inner.read().unwrap();
        inner.index.get(&command).map(|&i| inner.commands[i].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_cc_packing() {
        assert_eq!(four_cc(b"LDAS"), u32::from_le_bytes(*b"LDAS"));
        assert_ne!(CMD_VFS_READ, CMD_VFS_WRITE);
    }

    #[test]
    fn duplicate_registration_rejected() {
        let registry = CommandRegistry::new();
        let desc = CommandDesc {
            command: CMD_MONITOR_CHANGES,
            server_fn: None,
            client_fn: None,
            is_async: false,
        };
        registry.register(desc.clone()).unwrap();
        assert!(matches!(
            registry.register(desc),
            Err(RemoteError::DuplicateCommand(_))
        ));
    }
}
