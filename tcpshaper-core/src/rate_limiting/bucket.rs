use std::ops::{Deref, DerefMut};
use std::time::Duration;

use tcpshaper_common::ShaperError;
use tokio::time::Instant;
use tracing::debug;

use super::context::WaitContext;
use super::setting::RateValues;

/// Far enough in the future to never fire, without overflowing `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Token state of a bucket. Token count may be negative while
/// reservations are waiting for their turn.
#[derive(Debug)]
struct BucketState {
    rate: f64,
    burst: u64,
    tokens: f64,
    last: Instant,
    last_event: Instant,
}

/// Tokens taken from the bucket for a single admission
#[derive(Debug, Clone, Copy)]
struct Reserved {
    tokens: u64,
    time_to_act: Instant,
    rate: f64,
}

impl BucketState {
    fn new(values: RateValues, now: Instant) -> Self {
        Self {
            rate: values.limit.fill_rate(),
            burst: values.burst,
            tokens: values.burst as f64,
            last: now,
            last_event: now,
        }
    }

    fn is_unlimited(&self) -> bool {
        self.rate.is_infinite()
    }

    /// Token count as of `now` without committing it
    fn advance(&self, now: Instant) -> (Instant, f64) {
        let last = self.last.min(now);
        let elapsed = now.duration_since(last).as_secs_f64();
        let tokens = (self.tokens + elapsed * self.rate).min(self.burst as f64);
        (now, tokens)
    }

    fn reconfigure(&mut self, values: RateValues, now: Instant) {
        let rate = values.limit.fill_rate();
        if rate == self.rate && values.burst == self.burst {
            return;
        }

        if self.is_unlimited() {
            // coming out of unlimited mode with a full bucket
            self.tokens = values.burst as f64;
            self.last = now;
        } else {
            // settle what accrued under the old rate first
            let (last, tokens) = self.advance(now);
            self.last = last;
            self.tokens = tokens;
        }

        self.rate = rate;
        self.burst = values.burst;
        self.tokens = self.tokens.min(self.burst as f64);
    }

    fn reserve(
        &mut self,
        n: u64,
        now: Instant,
        max_wait: Option<Duration>,
    ) -> Result<Reserved, ShaperError> {
        if self.is_unlimited() {
            return Ok(Reserved {
                tokens: 0,
                time_to_act: now,
                rate: self.rate,
            });
        }
        if n > self.burst {
            return Err(ShaperError::UnsatisfiableRequest {
                requested: n,
                burst: self.burst,
            });
        }

        let (now, tokens) = self.advance(now);
        let tokens = tokens - n as f64;
        let wait = if tokens < 0.0 {
            Duration::try_from_secs_f64(-tokens / self.rate).unwrap_or(FAR_FUTURE)
        } else {
            Duration::ZERO
        };

        if let Some(max_wait) = max_wait {
            if wait > max_wait {
                return Err(ShaperError::DeadlineExceeded);
            }
        }

        let time_to_act = now.checked_add(wait).unwrap_or(now + FAR_FUTURE);
        self.last = now;
        self.tokens = tokens;
        self.last_event = time_to_act;

        Ok(Reserved {
            tokens: n,
            time_to_act,
            rate: self.rate,
        })
    }

    /// Gives back the part of a reservation that later reservations
    /// haven't already queued behind.
    fn cancel(&mut self, reserved: Reserved, now: Instant) {
        if reserved.tokens == 0 || self.is_unlimited() || reserved.time_to_act < now {
            return;
        }

        let queued_behind = self
            .last_event
            .saturating_duration_since(reserved.time_to_act)
            .as_secs_f64()
            * reserved.rate;
        let restore = reserved.tokens as f64 - queued_behind;
        if restore <= 0.0 {
            return;
        }

        let (last, tokens) = self.advance(now);
        self.last = last;
        self.tokens = (tokens + restore).min(self.burst as f64);

        if reserved.time_to_act == self.last_event {
            let own_duration =
                Duration::try_from_secs_f64(reserved.tokens as f64 / reserved.rate)
                    .unwrap_or(FAR_FUTURE);
            if let Some(previous) = reserved.time_to_act.checked_sub(own_duration) {
                if previous >= now {
                    self.last_event = previous;
                }
            }
        }
    }
}

/// A single token bucket: `burst` tokens of capacity refilled at `limit`
/// tokens per second. One token is one byte.
///
/// Requests that can't be served right away reserve their tokens
/// immediately and then sleep until the bucket has caught up, so that
/// concurrent callers queue behind each other instead of racing for
/// the same refill.
#[derive(Debug)]
pub struct TokenBucket {
    state: std::sync::Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(values: RateValues) -> Self {
        Self {
            state: std::sync::Mutex::new(BucketState::new(values, Instant::now())),
        }
    }

    #[allow(clippy::unwrap_used, reason = "panic on poison")]
    fn lock(&self) -> BucketGuard<'_> {
        BucketGuard::new(self.state.lock().unwrap())
    }

    /// Applies a new limit and burst, keeping the tokens accrued so far
    pub fn configure(&self, values: RateValues) {
        self.lock().reconfigure(values, Instant::now());
    }

    /// Tokens that would be available right now. Negative while
    /// reservations are outstanding.
    pub fn available(&self) -> f64 {
        let state = self.lock();
        if state.is_unlimited() {
            return f64::INFINITY;
        }
        state.advance(Instant::now()).1
    }

    /// Waits until `n` bytes may pass.
    ///
    /// Fails right away if `n` is larger than the burst or if the wait
    /// would outlast the deadline of `ctx`. If `ctx` is cancelled while
    /// waiting, or the returned future is dropped, the reservation is
    /// handed back to the bucket.
    pub async fn admit(&self, n: u64, ctx: &WaitContext) -> Result<(), ShaperError> {
        if let Some(error) = ctx.error() {
            return Err(error);
        }

        let now = Instant::now();
        let max_wait = ctx.deadline().map(|d| d.saturating_duration_since(now));
        let reserved = self.lock().reserve(n, now, max_wait)?;
        if reserved.time_to_act <= now {
            return Ok(());
        }

        debug!(
            bytes = n,
            wait = ?reserved.time_to_act.duration_since(now),
            "Waiting for bandwidth"
        );

        let mut reservation = Reservation {
            bucket: self,
            reserved: Some(reserved),
        };

        tokio::select! {
            biased;
            _ = tokio::time::sleep_until(reserved.time_to_act) => {
                reservation.settle();
                Ok(())
            }
            error = ctx.done() => Err(error),
        }
    }
}

/// Reserved tokens that go back to the bucket unless settled
struct Reservation<'a> {
    bucket: &'a TokenBucket,
    reserved: Option<Reserved>,
}

impl Reservation<'_> {
    fn settle(&mut self) {
        self.reserved = None;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(reserved) = self.reserved.take() {
            debug!(bytes = reserved.tokens, "Returning cancelled reservation");
            self.bucket.lock().cancel(reserved, Instant::now());
        }
    }
}

/// Keeps the bucket state from being locked across awaits
struct BucketGuard<'a> {
    inner: std::sync::MutexGuard<'a, BucketState>,
    _non_sendable: std::marker::PhantomData<*const ()>,
}

impl<'a> BucketGuard<'a> {
    fn new(inner: std::sync::MutexGuard<'a, BucketState>) -> Self {
        Self {
            inner,
            _non_sendable: std::marker::PhantomData,
        }
    }
}

impl Deref for BucketGuard<'_> {
    type Target = BucketState;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for BucketGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}
