use tracing_subscriber::EnvFilter;

/// Filter directives are read from this variable, e.g. `llama_bridge=debug`.
pub const LOG_ENV: &str = "LLAMA_BRIDGE_LOG";

/// Install a stderr subscriber unless the host process already has one.
pub fn init() {
    init_with_default("info");
}

pub fn init_with_default(default: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
