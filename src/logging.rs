use tracing_subscriber::{fmt, EnvFilter};

/// Install the tracing subscriber used by both binaries.
///
/// `RUST_LOG` narrows output; the default keeps our own `fernhill` target at
/// info and everything else at warn. Log records emitted through the `log`
/// facade (reqwest, cron) are bridged into tracing. Safe to call more than
/// once; later calls are no-ops.
pub fn init() {
    let _ = tracing_log::LogTracer::init();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,fernhill=info,fernhill_lib=info"));

    // Keep stdout clean for command output; diagnostics go to stderr.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
