//! Small helpers shared across the scaler

use chrono::TimeDelta;
use gridscale::Error;
use std::future::Future;
use std::time::Duration;

/// gets a timestamp N seconds ago
#[macro_export]
macro_rules! ago {
    ($seconds:expr) => {
        chrono::Utc::now() - chrono::Duration::seconds($seconds)
    };
}

/// Convert a number of seconds from our config into a chrono duration
///
/// Durations too large to represent saturate instead of panicking.
///
/// # Arguments
///
/// * `secs` - The number of seconds
#[must_use]
pub fn seconds(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

/// The outcome of a bounded poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    /// The operation finished with a value
    Done(T),
    /// The operation never finished within its attempts
    TimedOut,
}

impl<T> Attempt<T> {
    /// Get the value of this attempt or an error describing the timeout
    ///
    /// # Arguments
    ///
    /// * `msg` - The message to use if this attempt timed out
    pub fn or_scaling<M: Into<String>>(self, msg: M) -> Result<T, Error> {
        match self {
            Attempt::Done(value) => Ok(value),
            Attempt::TimedOut => Err(Error::scaling(msg)),
        }
    }
}

/// Poll an operation until it finishes or runs out of attempts
///
/// The operation returns `Ok(Some(_))` when it is done, `Ok(None)` when it
/// should be polled again and `Err` when it failed for good.
///
/// # Arguments
///
/// * `attempts` - The most times to poll this operation
/// * `delay` - How long to wait between polls
/// * `operation` - The operation to poll
pub async fn retry<T, F, Fut>(
    attempts: u64,
    delay: Duration,
    mut operation: F,
) -> Result<Attempt<T>, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, Error>>,
{
    for attempt in 1..=attempts {
        // poll our operation
        if let Some(value) = operation().await? {
            return Ok(Attempt::Done(value));
        }
        // only sleep if we have another attempt left
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    Ok(Attempt::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn huge_seconds_saturate() {
        assert_eq!(seconds(90), TimeDelta::seconds(90));
        assert_eq!(seconds(u64::MAX), TimeDelta::MAX);
        assert_eq!(seconds(i64::MAX as u64), TimeDelta::MAX);
        // a saturated timeout is never reached
        assert!(Utc::now() - ago!(3600) < seconds(u64::MAX));
    }

    #[tokio::test]
    async fn retry_finishes() -> Result<(), Error> {
        let polls = AtomicU64::new(0);
        let polls = &polls;
        let attempt = retry(5, Duration::from_millis(1), move || async move {
            // finish on the third poll
            let count = polls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok((count == 3).then_some(count))
        })
        .await?;
        assert_eq!(attempt, Attempt::Done(3));
        assert_eq!(polls.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn retry_times_out() -> Result<(), Error> {
        let polls = AtomicU64::new(0);
        let polls = &polls;
        let attempt: Attempt<()> = retry(4, Duration::from_millis(1), move || async move {
            polls.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
        .await?;
        assert_eq!(attempt, Attempt::TimedOut);
        assert_eq!(polls.load(Ordering::SeqCst), 4);
        assert!(matches!(attempt.or_scaling("never"), Err(Error::Scaling(_))));
        Ok(())
    }

    #[tokio::test]
    async fn retry_stops_on_errors() {
        let polls = AtomicU64::new(0);
        let polls = &polls;
        let result: Result<Attempt<()>, Error> =
            retry(4, Duration::from_millis(1), move || async move {
            polls.fetch_add(1, Ordering::SeqCst);
            Err(Error::new("broken"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }
}
