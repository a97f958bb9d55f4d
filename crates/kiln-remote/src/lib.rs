//! Connection-oriented request/response bus used to delegate bakes and file
//! I/O to a peer process.
//!
//! Commands are identified by a 32-bit FourCC code and registered with a
//! server-side handler and a client-side completion. A server handler may
//! answer immediately or mark itself `async` and reply later through
//! [`RemoteServer::send_response`]. Correlation from a response back to the
//! original caller uses an opaque 64-bit cookie echoed verbatim by the
//! server.

// crate-specific lint exceptions:
#![warn(missing_docs)]

mod client;
mod command;
mod error;
mod frame;
mod server;

pub use client::{DisconnectCallback, RemoteClient};
pub use command::{
    four_cc, ClientHandler, CommandDesc, CommandRegistry, FourCC, RequestContext, ServerHandler,
    ServerOutcome, CMD_COMPILE_SHADER, CMD_LOAD_ASSET, CMD_MONITOR_CHANGES, CMD_VFS_READ,
    CMD_VFS_WRITE,
};
pub use error::RemoteError;
pub use frame::MAX_ERROR_DESC;
pub use server::RemoteServer;
