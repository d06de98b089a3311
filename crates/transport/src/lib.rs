//! dirdiff-transport: local and SSH transports
//!
//! Handles SSH connections, agent deployment, and the agent session that
//! implements [`dirdiff_core::Transport`] over the framed protocol.

pub mod agent;
pub mod local;
pub mod ssh;

pub use agent::AgentBundle;
pub use local::LocalTransport;
pub use ssh::{AgentSession, SshTransport};

/// Target platform for agent binaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    LinuxX86_64,
    LinuxAarch64,
    DarwinX86_64,
    DarwinAarch64,
}

impl Platform {
    /// Every supported platform
    pub const ALL: [Self; 4] = [
        Self::LinuxX86_64,
        Self::LinuxAarch64,
        Self::DarwinX86_64,
        Self::DarwinAarch64,
    ];

    /// Detect platform from uname output
    #[must_use]
    pub fn from_uname(uname_s: &str, uname_m: &str) -> Option<Self> {
        let os = uname_s.trim().to_lowercase();
        let arch = uname_m.trim().to_lowercase();

        match (os.as_str(), arch.as_str()) {
            ("linux", "x86_64") => Some(Self::LinuxX86_64),
            ("linux", "aarch64" | "arm64") => Some(Self::LinuxAarch64),
            ("darwin", "x86_64") => Some(Self::DarwinX86_64),
            ("darwin", "arm64" | "aarch64") => Some(Self::DarwinAarch64),
            _ => None,
        }
    }

    /// Get the binary name suffix for this platform
    #[must_use]
    pub fn binary_suffix(&self) -> &'static str {
        match self {
            Self::LinuxX86_64 => "linux-x86_64",
            Self::LinuxAarch64 => "linux-aarch64",
            Self::DarwinX86_64 => "darwin-x86_64",
            Self::DarwinAarch64 => "darwin-aarch64",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_from_uname() {
        assert_eq!(
            Platform::from_uname("Linux", "x86_64"),
            Some(Platform::LinuxX86_64)
        );
        assert_eq!(
            Platform::from_uname("Linux\n", "aarch64\n"),
            Some(Platform::LinuxAarch64)
        );
        assert_eq!(
            Platform::from_uname("Darwin", "arm64"),
            Some(Platform::DarwinAarch64)
        );
        assert_eq!(Platform::from_uname("Windows", "x86_64"), None);
    }

    #[test]
    fn test_binary_suffixes_unique() {
        let mut suffixes: Vec<_> = Platform::ALL.iter().map(Platform::binary_suffix).collect();
        suffixes.sort_unstable();
        suffixes.dedup();
        assert_eq!(suffixes.len(), Platform::ALL.len());
    }
}
