use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::OnceCell;
use tempfile::{tempdir, TempDir};

use crate::core::ShmemConfig;

mod fifo_producers_tests;
mod lock_recovery_tests;
mod reqresp_threads_tests;
mod torn_read_tests;

static NAME_COUNTER: AtomicUsize = AtomicUsize::new(0);
static TRACING: OnceCell<()> = OnceCell::new();

/// Config whose link files live in a fresh temp dir. Keep the dir alive for the test.
pub(crate) fn test_config() -> Result<(ShmemConfig, TempDir), Box<dyn Error>> {
    init_tracing();
    let dir = tempdir()?;
    let cfg = ShmemConfig::builder()
        .data_dir(dir.path().to_string_lossy().into_owned())
        .lock_timeout_ms(2000)
        .build()?;
    Ok((cfg, dir))
}

/// Segment names must be unique across concurrently running tests.
pub(crate) fn unique_name(prefix: &str) -> String {
    format!(
        "{}_{}_{}",
        prefix,
        std::process::id(),
        NAME_COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

// RUST_LOG=crossipc=debug cargo test -- --nocapture
fn init_tracing() {
    TRACING.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
