//! A small exponential-backoff retry helper: build a `Retry`, clamp its
//! backoff, turn it into a stream, and `.next().await` between attempts.

use std::time::Duration;

use futures::Stream;
use rand::Rng;

/// Describes a retry schedule. Backoff starts at `initial_backoff` and
/// doubles on every step, up to `max_backoff`.
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: u32,
}

impl Default for Retry {
    fn default() -> Self {
        Retry {
            initial_backoff: Duration::from_millis(125),
            max_backoff: Duration::MAX,
            multiplier: 2,
        }
    }
}

impl Retry {
    /// Caps the backoff at `max`.
    pub fn clamp_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    /// Sets the initial backoff.
    pub fn initial_backoff(mut self, initial: Duration) -> Self {
        self.initial_backoff = initial;
        self
    }

    /// Turns this schedule into a stream that sleeps on every `.next().await`
    /// and never terminates on its own.
    pub fn into_retry_stream(self) -> impl Stream<Item = Duration> + Unpin {
        let mut backoff = self.initial_backoff;
        let max = self.max_backoff;
        let multiplier = self.multiplier;
        Box::pin(futures::stream::unfold((), move |()| {
            let sleep_for = backoff;
            backoff = (backoff * multiplier).min(max);
            // Jitter within [0.5, 1.0) of the nominal backoff so many
            // concurrent retriers don't reconnect in lockstep.
            let jittered = sleep_for.mul_f64(rand::thread_rng().gen_range(0.5..1.0));
            async move {
                tokio::time::sleep(jittered).await;
                Some((sleep_for, ()))
            }
        }))
    }
}
