//! Retry helpers for router facing operations
//!
//! Router services such as the call monitor port or the call-control
//! transport port may be switched off. Both are recovered the same way:
//! fail once, ask the router to enable the service, wait, try again.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::TelephonyResult;

/// Run `operation`; on a recoverable error run `enable`, wait `delay` and
/// retry exactly once.
///
/// The result of the second attempt is returned as is.
///
/// ```rust
/// # use routerphone_core::recovery::retry_once_after;
/// # use routerphone_core::TelephonyError;
/// # use std::time::Duration;
/// # async fn example() {
/// let result: Result<u32, TelephonyError> = retry_once_after(
///     "example",
///     || async { Ok(1) },
///     || async {},
///     Duration::from_millis(10),
/// )
/// .await;
/// assert_eq!(result.unwrap(), 1);
/// # }
/// ```
pub async fn retry_once_after<T, F, Fut, E, EFut>(
    operation_name: &str,
    mut operation: F,
    enable: E,
    delay: Duration,
) -> TelephonyResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TelephonyResult<T>>,
    E: FnOnce() -> EFut,
    EFut: Future<Output = ()>,
{
    match operation().await {
        Ok(result) => Ok(result),
        Err(e) if e.is_recoverable() => {
            warn!(
                operation = operation_name,
                error = %e,
                category = e.category(),
                delay_ms = delay.as_millis() as u64,
                "Operation failed, enabling service and retrying once"
            );

            enable().await;
            sleep(delay).await;

            let result = operation().await;
            if result.is_ok() {
                debug!(operation = operation_name, "Operation succeeded after enabling service");
            }
            result
        }
        Err(e) => Err(e),
    }
}
