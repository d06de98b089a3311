//! Agent binary bundling and deployment

use std::collections::HashMap;
use std::path::Path;

use color_eyre::Result;

use crate::Platform;

/// File name of the agent binary on the remote host
pub const AGENT_BINARY: &str = "dirdiff-agent";

/// Bundle of agent binaries for different platforms
///
/// Cross-compiled agents are embedded into the CLI at build time; the
/// binary matching the remote platform is uploaded on first connect.
pub struct AgentBundle {
    binaries: HashMap<Platform, &'static [u8]>,
}

impl AgentBundle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            binaries: HashMap::new(),
        }
    }

    pub fn add(&mut self, platform: Platform, data: &'static [u8]) {
        self.binaries.insert(platform, data);
    }

    #[must_use]
    pub fn get(&self, platform: Platform) -> Option<&[u8]> {
        self.binaries.get(&platform).copied()
    }

    #[must_use]
    pub fn has(&self, platform: Platform) -> bool {
        self.binaries.contains_key(&platform)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.binaries.is_empty()
    }

    /// Load `dirdiff-agent-<platform>` binaries from a directory
    ///
    /// # Errors
    /// Returns an error if a present binary cannot be read
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut bundle = Self::new();

        for platform in Platform::ALL {
            let suffix = platform.binary_suffix();
            let path = dir.join(format!("{AGENT_BINARY}-{suffix}"));
            if path.exists() {
                let data = std::fs::read(&path)?;
                tracing::debug!("Loaded agent for {suffix} ({} bytes)", data.len());
                // Bundles live for the whole process
                bundle.add(platform, Box::leak(data.into_boxed_slice()));
            }
        }

        Ok(bundle)
    }
}

impl Default for AgentBundle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_add_get() {
        let mut bundle = AgentBundle::new();
        static TEST_DATA: &[u8] = &[1, 2, 3];
        bundle.add(Platform::LinuxX86_64, TEST_DATA);

        assert!(bundle.has(Platform::LinuxX86_64));
        assert!(!bundle.has(Platform::LinuxAarch64));
        assert_eq!(bundle.get(Platform::LinuxX86_64), Some(&[1u8, 2, 3][..]));
        assert!(!bundle.is_empty());
    }

    #[test]
    fn test_from_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("dirdiff-agent-linux-aarch64"), b"elf").unwrap();
        std::fs::write(dir.path().join("unrelated"), b"x").unwrap();

        let bundle = AgentBundle::from_dir(dir.path()).unwrap();
        assert_eq!(bundle.get(Platform::LinuxAarch64), Some(&b"elf"[..]));
        assert!(!bundle.has(Platform::LinuxX86_64));
    }
}
