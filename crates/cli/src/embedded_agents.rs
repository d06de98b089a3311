//! Agent binaries for deployment to remote hosts
//!
//! Release builds embed agents at compile time: build.rs sets cfg flags when
//! `DIRDIFF_AGENT_*` env vars are present. Agents can also be loaded at run
//! time from the directory named by `DIRDIFF_AGENT_DIR`.

use color_eyre::Result;
use dirdiff_transport::AgentBundle;
#[cfg(any(
    dirdiff_embed_linux_x86_64,
    dirdiff_embed_linux_aarch64,
    dirdiff_embed_darwin_aarch64
))]
use dirdiff_transport::Platform;

/// Env var naming a directory of `dirdiff-agent-<platform>` binaries
const AGENT_DIR_VAR: &str = "DIRDIFF_AGENT_DIR";

/// Agents from `DIRDIFF_AGENT_DIR` if set, else the embedded ones
pub fn agent_bundle() -> Result<AgentBundle> {
    if let Some(dir) = std::env::var_os(AGENT_DIR_VAR) {
        tracing::debug!("Loading agents from {}", dir.to_string_lossy());
        return AgentBundle::from_dir(std::path::Path::new(&dir));
    }
    Ok(embedded_bundle())
}

/// Create an agent bundle with embedded binaries (if available)
fn embedded_bundle() -> AgentBundle {
    #[allow(unused_mut)]
    let mut bundle = AgentBundle::new();

    #[cfg(dirdiff_embed_linux_x86_64)]
    bundle.add(
        Platform::LinuxX86_64,
        include_bytes!(env!("DIRDIFF_AGENT_LINUX_X86_64")),
    );

    #[cfg(dirdiff_embed_linux_aarch64)]
    bundle.add(
        Platform::LinuxAarch64,
        include_bytes!(env!("DIRDIFF_AGENT_LINUX_AARCH64")),
    );

    #[cfg(dirdiff_embed_darwin_aarch64)]
    bundle.add(
        Platform::DarwinAarch64,
        include_bytes!(env!("DIRDIFF_AGENT_DARWIN_AARCH64")),
    );

    bundle
}
