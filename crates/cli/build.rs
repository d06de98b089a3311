fn main() {
    // Register expected cfg flags for check-cfg
    let agents = [
        ("DIRDIFF_AGENT_LINUX_X86_64", "dirdiff_embed_linux_x86_64"),
        ("DIRDIFF_AGENT_LINUX_AARCH64", "dirdiff_embed_linux_aarch64"),
        ("DIRDIFF_AGENT_DARWIN_AARCH64", "dirdiff_embed_darwin_aarch64"),
    ];

    // Agent paths are set by the release build; each one that is present
    // gets embedded through include_bytes!(env!(..))
    for (env_var, cfg_flag) in agents {
        println!("cargo::rustc-check-cfg=cfg({cfg_flag})");
        println!("cargo:rerun-if-env-changed={env_var}");
        if std::env::var(env_var).is_ok() {
            println!("cargo:rustc-cfg={cfg_flag}");
        }
    }
}
