use kiln_remote::RemoteError;
use kiln_vfs::VfsError;

/// Error type for the asset pipeline.
#[derive(thiserror::Error, Debug)]
pub enum AssetError {
    /// A type id or type name was registered twice.
    #[error("asset type '{0}' is already registered")]
    TypeAlreadyRegistered(String),

    /// An operation referenced a type id that was never registered.
    #[error("asset type {0:#010x} is not registered")]
    UnknownType(u32),

    /// A fixed-capacity pool ran out of slots or bytes. Pools are sized at
    /// initialization to accommodate peak.
    #[error("{0} pool exhausted")]
    AllocatorExhaustion(&'static str),

    /// A stale or foreign handle was passed in.
    #[error("invalid handle")]
    InvalidHandle,

    /// Group operation that requires the Idle state.
    #[error("group is not idle")]
    GroupNotIdle,

    /// Scheduler-driving calls are main-thread-only.
    #[error("operation is restricted to the main thread")]
    NotMainThread,

    /// The source file could not be opened.
    #[error("Failed opening source file '{0}'")]
    SourceMissing(String),

    /// The baker rejected the source.
    #[error("bake of '{path}' failed: {message}")]
    BakeFailure {
        /// Source path of the asset.
        path: String,
        /// Short baker-provided message.
        message: String,
    },

    /// Cache entry with a bad magic, version, or checksum.
    #[error("corrupt cache entry '{0}'")]
    CacheCorrupt(String),

    /// The remote connection dropped with requests in flight.
    #[error("remote connection lost: {0}")]
    RemoteDisconnect(String),

    /// Record (de)serialization failure.
    #[error("record serialization failed: {0}")]
    Serialization(String),

    /// Virtual filesystem failure.
    #[error(transparent)]
    Vfs(#[from] VfsError),

    /// Command bus failure.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
