//! Process logging setup

/// Load `.env` and install the stderr logger
///
/// `RUST_LOG` overrides the default `info` filter. Safe to call more than
/// once; later calls are no-ops.
pub fn init_logging() {
    dotenv::dotenv().ok();

    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .try_init();
}
