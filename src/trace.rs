use std::sync::OnceLock;

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, Layer, Registry, prelude::*};

use crate::settings::LogFormat;

/// Filter directives used when neither `SHOAL_LOG` nor `RUST_LOG` is set.
const DEFAULT_DIRECTIVES: &str = "info,slatedb=warn";

static INSTALLED: OnceLock<()> = OnceLock::new();

fn env_filter() -> EnvFilter {
    std::env::var("SHOAL_LOG")
        .ok()
        .and_then(|d| EnvFilter::try_new(d).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVES))
}

fn fmt_layer<W>(format: LogFormat, writer: W) -> Box<dyn Layer<Registry> + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_level(true);
    match format {
        LogFormat::Text => layer.compact().with_filter(env_filter()).boxed(),
        LogFormat::Json => layer.json().with_filter(env_filter()).boxed(),
    }
}

/// Install the global subscriber for the binary. Later calls are no-ops.
pub fn init(format: LogFormat) -> anyhow::Result<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }
    tracing_subscriber::registry()
        .with(fmt_layer(format, std::io::stderr))
        .try_init()?;
    let _ = INSTALLED.set(());
    Ok(())
}

/// Subscriber for test binaries: output goes through libtest capture.
fn init_for_tests() {
    INSTALLED.get_or_init(|| {
        // another harness may already own the global subscriber
        let _ = tracing_subscriber::registry()
            .with(fmt_layer(LogFormat::Text, tracing_subscriber::fmt::TestWriter::new()))
            .try_init();
    });
}

/// Run an async test body with logging installed. Used by `#[shoal::test]`.
pub async fn with_test_tracing<F, Fut, T>(test_name: &str, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    init_for_tests();
    tracing::debug!(test = test_name, "starting test");
    f().await
}

/// Synchronous counterpart of `with_test_tracing`.
pub fn with_test_tracing_sync<F, T>(test_name: &str, f: F) -> T
where
    F: FnOnce() -> T,
{
    init_for_tests();
    tracing::debug!(test = test_name, "starting test");
    f()
}
