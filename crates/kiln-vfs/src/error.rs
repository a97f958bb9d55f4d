/// Error type for the virtual filesystem.
#[derive(thiserror::Error, Debug)]
pub enum VfsError {
    /// Two mounts may not share an alias.
    #[error("alias '{0}' is already mounted")]
    AliasInUse(String),

    /// Blocking reads are not served by remote mounts.
    #[error("'{0}' resolves to a remote mount; use read_async")]
    RemoteBlockingRead(String),

    /// Writes only go to local mounts.
    #[error("'{0}' does not resolve to a writable local mount")]
    NotWritable(String),

    /// Remote mount used without a connected remote client.
    #[error("no remote connection for '{0}'")]
    RemoteUnavailable(String),

    /// Underlying filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
