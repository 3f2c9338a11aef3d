#[cfg(feature = "telemetry")]
use std::sync::OnceLock;

#[cfg(feature = "telemetry")]
use tracing_subscriber::{EnvFilter, fmt};

/// Initialize tracing subscriber once per process.
///
/// Events go to stderr so that JSON output on stdout stays clean.
#[cfg(feature = "telemetry")]
pub fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();

    INIT.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("capcheck=info"));
        let _ = fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

#[cfg(not(feature = "telemetry"))]
pub fn init_tracing() {}

/// Instrument an inline block with a span if telemetry is enabled.
#[macro_export]
macro_rules! instrument_block {
    ($name:expr, $block:block) => {{
        #[cfg(feature = "telemetry")]
        {
            let span = tracing::info_span!("capcheck", phase = $name);
            let _guard = span.enter();
            (|| $block)()
        }
        #[cfg(not(feature = "telemetry"))]
        {
            (|| $block)()
        }
    }};
    ($name:expr, $target:expr, $block:block) => {{
        #[cfg(feature = "telemetry")]
        {
            let span = tracing::debug_span!("capcheck", phase = $name, target = %$target);
            let _guard = span.enter();
            (|| $block)()
        }
        #[cfg(not(feature = "telemetry"))]
        {
            let _ = &$target;
            (|| $block)()
        }
    }};
}

/// `tracing::debug!` when telemetry is enabled, nothing otherwise.
#[macro_export]
macro_rules! capcheck_debug {
    ($($arg:tt)+) => {{
        #[cfg(feature = "telemetry")]
        tracing::debug!($($arg)+);
    }};
}
