//! Cache directory layout and resource identity.
//!
//! Every resource owns three paths inside the cache directory: a growable
//! partial data file, its metadata file, and the final immutable complete
//! file created on promotion.

use std::fmt;
use std::path::PathBuf;

/// Opaque identifier of one cached resource.
///
/// Rendered as lowercase hex for file names and log output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId(Vec<u8>);

impl ResourceId {
    /// Creates an identifier from raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Configuration for a cache directory.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding every resource's on-disk artifacts
    pub cache_dir: PathBuf,
}

impl CacheConfig {
    /// Creates a configuration rooted at `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// Computes the three per-resource paths for `resource_id`.
    pub fn resource_paths(&self, resource_id: &ResourceId) -> ResourcePaths {
        let name = resource_id.to_string();
        ResourcePaths {
            partial: self.cache_dir.join(format!("{name}_partial")),
            meta: self.cache_dir.join(format!("{name}_partial.meta")),
            complete: self.cache_dir.join(name),
        }
    }
}

/// On-disk paths of one resource.
#[derive(Debug, Clone)]
pub struct ResourcePaths {
    /// Growable sparse file receiving offset writes
    pub partial: PathBuf,
    /// Serialized range map for the partial file
    pub meta: PathBuf,
    /// Final immutable artifact created on completion
    pub complete: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_hex_display() {
        let id = ResourceId::new(vec![0x00, 0xab, 0x10]);
        assert_eq!(id.to_string(), "00ab10");
    }

    #[test]
    fn test_resource_paths_layout() {
        let config = CacheConfig::new("/var/cache/media");
        let paths = config.resource_paths(&ResourceId::new(vec![0x01, 0x02]));

        assert_eq!(paths.partial, PathBuf::from("/var/cache/media/0102_partial"));
        assert_eq!(
            paths.meta,
            PathBuf::from("/var/cache/media/0102_partial.meta")
        );
        assert_eq!(paths.complete, PathBuf::from("/var/cache/media/0102"));
    }
}
