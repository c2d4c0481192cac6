// =============================================================================
// Clock — injectable time source
// =============================================================================
//
// Every duration computation in the engine (job timeouts, breaker retry
// windows, holding times, poll deadlines) goes through this trait so that
// tests can drive time deterministically with `ManualClock`.
// =============================================================================

use async_trait::async_trait;

/// Time source abstraction. `now_ms` is a UNIX-epoch millisecond read; `sleep`
/// suspends the calling task.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
    async fn sleep(&self, ms: u64);
}

/// Production clock backed by the system time and tokio timers.
#[derive(Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }

    async fn sleep(&self, ms: u64) {
        tokio::time::sleep(tokio::time::Duration::from_millis(ms)).await;
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ManualClock;
    use super::*;

    #[test]
    fn system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }

    #[tokio::test]
    async fn manual_clock_advances_on_sleep() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.sleep(500).await;
        assert_eq!(clock.now_ms(), 1_500);
        clock.advance(250);
        assert_eq!(clock.now_ms(), 1_750);
    }
}
