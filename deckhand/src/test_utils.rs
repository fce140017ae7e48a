//! Fixtures shared by unit tests.

use crate::accounts::AccountRegistry;
use crate::config::Config;
use std::future::Future;
use std::time::Duration;

pub fn registry() -> AccountRegistry {
    AccountRegistry::new(Duration::from_secs(24 * 60 * 60))
}

/// Config with millisecond backoffs so retry paths finish quickly.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.provisioning.max_retries = 3;
    config.provisioning.backoff = Duration::from_millis(1);
    config.provisioning.max_backoff = Duration::from_millis(5);
    config.provisioning.attempt_timeout = Duration::from_secs(5);
    config
}

/// Poll `check` until it returns `Some`, failing the test after five seconds.
pub async fn wait_for<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within 5s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
