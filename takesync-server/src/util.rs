use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Granularity at which sleeping loops notice cancellation.
pub const CANCEL_TICK: Duration = Duration::from_millis(100);

/// Sleep for `duration` in [`CANCEL_TICK`] steps.
///
/// Returns `false` as soon as `cancel` fires, `true` once the full time passed.
pub async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep((deadline - now).min(CANCEL_TICK)).await;
    }
}

// Poison-tolerant guards: the data behind these locks stays valid after a panic.

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_runs_to_completion() {
        let cancel = CancellationToken::new();
        let start = Instant::now();
        assert!(sleep_cancellable(Duration::from_millis(350), &cancel).await);
        assert_eq!(start.elapsed(), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_aborts_within_a_tick() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            trigger.cancel();
        });
        let start = Instant::now();
        assert!(!sleep_cancellable(Duration::from_secs(15), &cancel).await);
        assert!(start.elapsed() <= Duration::from_millis(300));
    }
}
