use crate::FourCC;

/// Error type for the remote command bus.
#[derive(thiserror::Error, Debug)]
pub enum RemoteError {
    /// A command was registered twice under the same code.
    #[error("command {0:#010x} is already registered")]
    DuplicateCommand(FourCC),

    /// A frame arrived for a command that was never registered.
    #[error("unknown command {0:#010x}")]
    UnknownCommand(FourCC),

    /// The client is not connected to a server.
    #[error("not connected")]
    NotConnected,

    /// `send_response` was called for a command with no deferred request.
    #[error("no pending request for command {0:#010x}")]
    NoPendingRequest(FourCC),

    /// Underlying socket failure.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}
