use serde::{Deserialize, Serialize};
use xxhash_rust::xxh32::Xxh32;

/// Platform an asset is baked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetPlatform {
    /// Pick the platform the process runs on.
    Auto,
    /// Desktop.
    Pc,
    /// Mobile (bundle-mounted assets).
    Mobile,
}

impl Default for AssetPlatform {
    fn default() -> Self {
        Self::Auto
    }
}

impl AssetPlatform {
    /// Short name, used for meta-sidecar override children.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Pc => "pc",
            Self::Mobile => "mobile",
        }
    }

    /// Resolves `Auto` to the platform this process targets.
    pub fn resolved(self) -> Self {
        match self {
            Self::Auto => Self::Pc,
            other => other,
        }
    }
}

/// A declarative request for one asset: what type, from where, for which
/// platform, with which type-specific knobs. Two requests are equivalent
/// iff their [`AssetParams::params_hash`] values are equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetParams {
    /// Registered asset type id (FourCC).
    pub type_id: u32,
    /// Virtual source path (`/{alias}/...`).
    pub path: String,
    /// Target platform.
    pub platform: AssetPlatform,
    /// Opaque type-specific parameter blob, hashed content-sensitively.
    pub extra: Vec<u8>,
    /// Skip GPU object creation for this asset. Not part of the identity
    /// hash.
    pub dont_create_resources: bool,
}

impl AssetParams {
    /// Creates params with no type-specific extras.
    pub fn new(type_id: u32, path: impl Into<String>, platform: AssetPlatform) -> Self {
        Self {
            type_id,
            path: path.into(),
            platform,
            extra: Vec::new(),
            dont_create_resources: false,
        }
    }

    /// Content-sensitive 32-bit identity of `(type, path, platform,
    /// extras)`; drives de-duplication in the asset database.
    pub fn params_hash(&self) -> u32 {
        let mut hasher = Xxh32::new(0);
        hasher.update(&self.type_id.to_le_bytes());
        hasher.update(self.path.as_bytes());
        hasher.update(&(self.platform.resolved() as u32).to_le_bytes());
        hasher.update(&self.extra);
        hasher.digest()
    }
}
