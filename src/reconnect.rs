use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Delay before the next connection attempt after an unplanned disconnect.
#[derive(Clone)]
pub enum ReconnectDelay {
    /// The same delay before every attempt.
    Fixed(Duration),
    /// `initial`, doubling per consecutive attempt, capped at `max`.
    Exponential { initial: Duration, max: Duration },
    /// Caller-supplied function of the attempt number (1 for the first retry).
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl ReconnectDelay {
    pub fn custom(f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        ReconnectDelay::Custom(Arc::new(f))
    }

    /// Delay before attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            ReconnectDelay::Fixed(d) => *d,
            ReconnectDelay::Exponential { initial, max } => {
                let shift = attempt.saturating_sub(1).min(31);
                initial
                    .checked_mul(1u32 << shift)
                    .map_or(*max, |d| d.min(*max))
            }
            ReconnectDelay::Custom(f) => f(attempt),
        }
    }
}

impl Default for ReconnectDelay {
    fn default() -> Self {
        ReconnectDelay::Fixed(Duration::from_secs(5))
    }
}

impl fmt::Debug for ReconnectDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconnectDelay::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            ReconnectDelay::Exponential { initial, max } => f
                .debug_struct("Exponential")
                .field("initial", initial)
                .field("max", max)
                .finish(),
            ReconnectDelay::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Attempt bookkeeping for the reconnection loop.
#[derive(Debug)]
pub(crate) struct Backoff {
    delay: ReconnectDelay,
    attempts: u32,
}

impl Backoff {
    pub(crate) fn new(delay: ReconnectDelay) -> Self {
        Self { delay, attempts: 0 }
    }

    /// Count one more attempt and return `(attempt, delay before it)`.
    pub(crate) fn next(&mut self) -> (u32, Duration) {
        self.attempts = self.attempts.saturating_add(1);
        (self.attempts, self.delay.delay_for(self.attempts))
    }

    /// A session reached CONNECTED.
    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_delay_is_constant() {
        let mut b = Backoff::new(ReconnectDelay::Fixed(Duration::from_millis(250)));
        assert_eq!(b.next(), (1, Duration::from_millis(250)));
        assert_eq!(b.next(), (2, Duration::from_millis(250)));
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let delay = ReconnectDelay::Exponential {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        };
        assert_eq!(delay.delay_for(1), Duration::from_secs(1));
        assert_eq!(delay.delay_for(2), Duration::from_secs(2));
        assert_eq!(delay.delay_for(5), Duration::from_secs(16));
        assert_eq!(delay.delay_for(6), Duration::from_secs(30));
        assert_eq!(delay.delay_for(400), Duration::from_secs(30));
    }

    #[test]
    fn custom_sees_attempt_number() {
        let mut b = Backoff::new(ReconnectDelay::custom(|n| Duration::from_millis(100 * n as u64)));
        b.next();
        assert_eq!(b.next(), (2, Duration::from_millis(200)));
        b.reset();
        assert_eq!(b.attempts(), 0);
        assert_eq!(b.next(), (1, Duration::from_millis(100)));
    }
}
