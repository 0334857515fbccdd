//! Circuit breaker guarding a node's send pipeline.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Breaker tuning knobs.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Minimum completions in a window before the error rate is judged.
    pub volume_threshold: u32,
    /// Error percentage (0-100) that trips the breaker.
    pub error_threshold_percentage: u32,
    /// How long an open breaker sleeps before allowing a canary.
    pub sleep_window: Duration,
    /// Length of the rolling accounting window.
    pub rolling_window: Duration,
    /// Timeout applied to the half-open canary.
    pub canary_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            volume_threshold: 20,
            error_threshold_percentage: 50,
            sleep_window: Duration::from_secs(5),
            rolling_window: Duration::from_secs(60),
            canary_timeout: Duration::from_millis(500),
        }
    }
}

/// Observable breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Traffic flows; failures are being counted.
    Closed,
    /// Traffic is rejected until the sleep window elapses.
    Open,
    /// One canary probe decides between Closed and Open.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug)]
struct BreakerWindow {
    state: BreakerState,
    window_start: Instant,
    total: u32,
    failed: u32,
    opened_at: Option<Instant>,
    canary_in_flight: bool,
}

/// Failure-rate circuit breaker with a half-open canary probe.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    window: Mutex<BreakerWindow>,
}

impl CircuitBreaker {
    /// Creates a breaker with the given configuration.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            window: Mutex::new(BreakerWindow {
                state: BreakerState::Closed,
                window_start: Instant::now(),
                total: 0,
                failed: 0,
                opened_at: None,
                canary_in_flight: false,
            }),
        }
    }

    /// Returns the canary timeout from the configuration.
    pub fn canary_timeout(&self) -> Duration {
        self.config.canary_timeout
    }

    /// Returns the current state, transitioning Open to HalfOpen once
    /// the sleep window has elapsed.
    pub fn state(&self) -> BreakerState {
        let mut window = self.window.lock().expect("breaker lock");
        if window.state == BreakerState::Open {
            if let Some(opened_at) = window.opened_at {
                if opened_at.elapsed() >= self.config.sleep_window {
                    window.state = BreakerState::HalfOpen;
                    window.canary_in_flight = false;
                }
            }
        }
        window.state
    }

    /// Claims the single half-open canary slot.
    ///
    /// Returns `true` for exactly one caller per half-open period; the
    /// rest fail fast as if the breaker were open.
    pub fn try_claim_canary(&self) -> bool {
        let mut window = self.window.lock().expect("breaker lock");
        if window.state == BreakerState::HalfOpen && !window.canary_in_flight {
            window.canary_in_flight = true;
            true
        } else {
            false
        }
    }

    /// Records a successful completion.
    pub fn mark_success(&self) {
        let mut window = self.window.lock().expect("breaker lock");
        match window.state {
            BreakerState::HalfOpen => {
                tracing::info!("circuit breaker closing after successful canary");
                window.state = BreakerState::Closed;
                window.opened_at = None;
                window.canary_in_flight = false;
                window.total = 0;
                window.failed = 0;
                window.window_start = Instant::now();
            }
            BreakerState::Closed => {
                self.roll_window(&mut window);
                window.total += 1;
            }
            BreakerState::Open => {}
        }
    }

    /// Records a failed completion, possibly tripping the breaker.
    pub fn mark_failure(&self) {
        let mut window = self.window.lock().expect("breaker lock");
        match window.state {
            BreakerState::HalfOpen => {
                tracing::warn!("circuit breaker canary failed, reopening");
                window.state = BreakerState::Open;
                window.opened_at = Some(Instant::now());
                window.canary_in_flight = false;
            }
            BreakerState::Closed => {
                self.roll_window(&mut window);
                window.total += 1;
                window.failed += 1;

                if window.total >= self.config.volume_threshold {
                    let percentage = window.failed * 100 / window.total;
                    if percentage >= self.config.error_threshold_percentage {
                        tracing::warn!(
                            failed = window.failed,
                            total = window.total,
                            "circuit breaker opening"
                        );
                        window.state = BreakerState::Open;
                        window.opened_at = Some(Instant::now());
                    }
                }
            }
            BreakerState::Open => {}
        }
    }

    fn roll_window(&self, window: &mut BreakerWindow) {
        if window.window_start.elapsed() >= self.config.rolling_window {
            window.window_start = Instant::now();
            window.total = 0;
            window.failed = 0;
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
