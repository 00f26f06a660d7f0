//! Test utilities for heart.

pub mod remote;

/// A valid twelve-word BIP39 phrase.
pub const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon \
    abandon abandon abandon abandon abandon abandon about";

/// Enable tracing with the RUST_LOG environment variable.
///
/// This is intended to be used in tests, so it defaults to DEBUG level.
pub fn enable_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::DEBUG.into())
                .from_env_lossy(),
        )
        .try_init();
}

/// Run a block repeatedly until it returns a value or breaks, panicking
/// when the timeout (in milliseconds) elapses first.
///
/// ```ignore
/// let n = iter_check!(1000, 10, {
///     let n = count();
///     if n > 2 {
///         return n;
///     }
/// });
/// ```
#[macro_export]
macro_rules! iter_check {
    ($timeout_ms:expr, $sleep_ms:expr, $code:block) => {
        tokio::time::timeout(
            std::time::Duration::from_millis($timeout_ms),
            async {
                loop {
                    $code
                    tokio::time::sleep(std::time::Duration::from_millis(
                        $sleep_ms,
                    ))
                    .await;
                }
            },
        )
        .await
        .expect("iter_check timed out")
    };
    ($timeout_ms:expr, $code:block) => {
        $crate::iter_check!($timeout_ms, 10, $code)
    };
}
