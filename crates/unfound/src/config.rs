use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uf_cache::CacheConfig;
use uf_error::{Result, UfError};
use uf_notify::NotifyConfig;
use uf_types::{BlockSize, DEFAULT_BLOCK_SIZE};

/// Backing volume of the namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// Block size in bytes. Default: 4096.
    pub block_size: u32,
    /// Volume size in blocks. Default: 1024 (4 MiB at the default block size).
    pub volume_blocks: u64,
    /// Host file holding the volume's blocks. In memory when unset.
    pub backing_file: Option<PathBuf>,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            volume_blocks: 1024,
            backing_file: None,
        }
    }
}

impl NamespaceConfig {
    pub fn block_size(&self) -> Result<BlockSize> {
        BlockSize::new(self.block_size).ok_or_else(|| {
            UfError::InvalidArgument(format!(
                "namespace block_size {} is not a power of two in 512..=65536",
                self.block_size
            ))
        })
    }

    /// Volume length in bytes.
    pub fn volume_bytes(&self) -> Result<u64> {
        self.volume_blocks
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| UfError::InvalidArgument("namespace volume size overflows".to_owned()))
    }
}

/// Combined configuration of a running system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnfoundConfig {
    pub cache: CacheConfig,
    pub notify: NotifyConfig,
    pub namespace: NamespaceConfig,
}

impl UnfoundConfig {
    /// Parse a JSON document. Missing keys take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| UfError::InvalidArgument(format!("invalid config: {err}")))
    }

    /// Read and parse a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.notify.validate()?;
        self.namespace.block_size()?;
        if self.namespace.volume_blocks == 0 {
            return Err(UfError::InvalidArgument(
                "namespace volume_blocks must be > 0".to_owned(),
            ));
        }
        self.namespace.volume_bytes()?;
        Ok(())
    }
}
