use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber at INFO, overridable through `RUST_LOG`.
pub fn init() {
    init_with_level(LevelFilter::INFO);
}

pub fn init_with_level(level: LevelFilter) {
    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());
    // the writer thread has to outlive main, there is no shutdown hook
    std::mem::forget(guard);
    tracing_subscriber::registry()
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking)
                .compact(),
        )
        .init();
}
