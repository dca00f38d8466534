//! Retry policies of the HTTP sink clients.

use std::fmt;
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;
/// Default delay between attempts.
pub const DEFAULT_DELAY: Duration = Duration::from_secs(15);
/// Default upper bound of the exponential delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
/// Default timeout of a single attempt.
pub const DEFAULT_TRY_TIMEOUT: Duration = Duration::from_secs(30);

/// How the delay grows between attempts.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RetryMode {
    /// Every attempt waits the same delay.
    #[default]
    Fixed,
    /// The delay doubles on every attempt, up to the maximum delay.
    Exponential,
}

impl RetryMode {
    /// Parses the configured mode by exact match.
    pub fn parse(mode: &str) -> Option<Self> {
        match mode {
            "fixed" => Some(Self::Fixed),
            "exponential" => Some(Self::Exponential),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Exponential => "exponential",
        }
    }
}

impl fmt::Display for RetryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw retry overrides as read from configuration.
///
/// Values that were present but could not be parsed as integers are `None`, and have already
/// been reported while reading the configuration.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RetryOverrides {
    pub max_retries: Option<i64>,
    pub delay_secs: Option<i64>,
    pub max_delay_secs: Option<i64>,
    pub try_timeout_secs: Option<i64>,
    pub mode: Option<String>,
}

/// Retry behavior of a sink client. Immutable once derived.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
    pub max_delay: Duration,
    pub try_timeout: Duration,
    pub mode: RetryMode,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delay: DEFAULT_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            try_timeout: DEFAULT_TRY_TIMEOUT,
            mode: RetryMode::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Applies every positive override on top of the defaults.
    ///
    /// Non-positive overrides and unknown modes are rejected with a warning.
    pub fn derive(overrides: &RetryOverrides) -> Self {
        let mut policy = Self::default();

        if let Some(value) = positive("max retries", overrides.max_retries) {
            policy.max_retries = u32::try_from(value).unwrap_or(u32::MAX);
        }
        if let Some(value) = positive("delay", overrides.delay_secs) {
            policy.delay = Duration::from_secs(value);
        }
        if let Some(value) = positive("max delay", overrides.max_delay_secs) {
            policy.max_delay = Duration::from_secs(value);
        }
        if let Some(value) = positive("try timeout", overrides.try_timeout_secs) {
            policy.try_timeout = Duration::from_secs(value);
        }

        if let Some(ref mode) = overrides.mode {
            match RetryMode::parse(mode) {
                Some(mode) => policy.mode = mode,
                None => apk_log::warn!(
                    "unknown retry mode `{mode}`, falling back to {}",
                    RetryMode::Fixed
                ),
            }
        }

        policy
    }

    /// Starts a new backoff sequence following this policy.
    pub fn backoff(&self) -> RetryBackoff {
        RetryBackoff::new(*self)
    }
}

fn positive(name: &str, value: Option<i64>) -> Option<u64> {
    let value = value?;
    match u64::try_from(value) {
        Ok(value) if value > 0 => Some(value),
        _ => {
            apk_log::warn!("ignoring non-positive retry {name} override {value}, using the default");
            None
        }
    }
}

enum Schedule {
    Fixed(Duration),
    Exponential(ExponentialBackoff),
}

/// A running backoff sequence.
///
/// [`next_backoff`](Self::next_backoff) yields the delay before each retry until the policy's
/// retries are used up. [`next_delay`](Self::next_delay) never runs out and is meant for
/// reconnection loops that retry until they succeed.
pub struct RetryBackoff {
    policy: RetryPolicy,
    schedule: Schedule,
    attempt: u32,
    started: Instant,
}

impl RetryBackoff {
    fn new(policy: RetryPolicy) -> Self {
        let schedule = match policy.mode {
            RetryMode::Fixed => Schedule::Fixed(policy.delay),
            RetryMode::Exponential => Schedule::Exponential(
                ExponentialBackoffBuilder::new()
                    .with_initial_interval(policy.delay)
                    .with_randomization_factor(0.0)
                    .with_multiplier(2.0)
                    .with_max_interval(policy.max_delay.max(policy.delay))
                    .with_max_elapsed_time(None)
                    .build(),
            ),
        };

        Self {
            policy,
            schedule,
            attempt: 0,
            started: Instant::now(),
        }
    }

    /// Returns the delay before the next retry, or `None` once all retries were used.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_retries {
            return None;
        }
        Some(self.next_delay())
    }

    /// Returns the delay before the next attempt, without a retry limit.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        match self.schedule {
            Schedule::Fixed(delay) => delay,
            Schedule::Exponential(ref mut backoff) => {
                backoff.next_backoff().unwrap_or(self.policy.max_delay)
            }
        }
    }

    /// Number of delays handed out so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// When the sequence started.
    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.started = Instant::now();
        if let Schedule::Exponential(ref mut backoff) = self.schedule {
            backoff.reset();
        }
    }
}

impl fmt::Debug for RetryBackoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryBackoff")
            .field("policy", &self.policy)
            .field("attempt", &self.attempt)
            .finish()
    }
}
