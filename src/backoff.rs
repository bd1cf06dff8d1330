use std::time::Duration;

/// Computes the delay to wait before a retry.
///
/// `attempt` is the 1-based number of the attempt that just failed, so the
/// first retry asks for `delay(1)`. Implementations must be pure.
pub trait BackoffStrategy: Send + Sync {
    fn delay(&self, attempt: u32) -> Duration;
}

impl<F> BackoffStrategy for F
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay(&self, attempt: u32) -> Duration {
        self(attempt)
    }
}

/// Retries immediately.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NoBackoff;

impl BackoffStrategy for NoBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// Waits the same amount before every retry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConstantBackoff(pub Duration);

impl BackoffStrategy for ConstantBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// `base * multiplier^(attempt - 1)`, saturating at [`Duration::MAX`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub multiplier: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, multiplier: u32) -> Self {
        Self { base, multiplier }
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let mut delay = self.base;
        for _ in 1..attempt {
            if delay.is_zero() || delay == Duration::MAX {
                break;
            }
            delay = delay.saturating_mul(self.multiplier);
        }
        delay
    }
}

/// `base * fib(attempt)` with `fib(1) = fib(2) = 1`, saturating at
/// [`Duration::MAX`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FibonacciBackoff(pub Duration);

impl BackoffStrategy for FibonacciBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let (mut prev, mut current) = (Duration::ZERO, self.0);
        for _ in 1..attempt {
            if current == Duration::MAX {
                break;
            }
            let next = prev.saturating_add(current);
            prev = current;
            current = next;
        }
        current
    }
}
