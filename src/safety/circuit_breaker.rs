//! Volatility and loss-streak circuit breaker.
//!
//! `Active -> VolatilityHalt -> Active` on ATR spikes with a fixed cooldown,
//! and `Active | VolatilityHalt -> KillSwitch` on loss streaks or daily loss.
//! Leaving `KillSwitch` needs [`CircuitBreaker::manual_reset`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::config::CircuitBreakerConfig;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Active,
    /// Trading paused until the cooldown ends and a recovery attempt succeeds.
    VolatilityHalt { until: DateTime<Utc> },
    /// Terminal until a manual reset.
    KillSwitch,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Active => write!(f, "ACTIVE"),
            BreakerState::VolatilityHalt { .. } => write!(f, "VOLATILITY_HALT"),
            BreakerState::KillSwitch => write!(f, "KILL_SWITCH"),
        }
    }
}

/// One recorded transition.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerEvent {
    /// State entered.
    pub state: BreakerState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Result of [`CircuitBreaker::try_recover`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Recovered,
    /// The cooldown has not elapsed yet.
    NotReady { remaining: Duration },
    /// Nothing to recover from.
    NotHalted,
    /// The breaker is in KillSwitch and only a manual reset clears it.
    ManualResetRequired,
}

struct Inner {
    state: BreakerState,
    atr_history: VecDeque<Decimal>,
    /// Timestamps of the current run of losing trades.
    loss_streak: VecDeque<DateTime<Utc>>,
    daily: Option<(NaiveDate, Decimal)>,
    events: Vec<BreakerEvent>,
    /// Number of events already handed out by `take_new_events`.
    delivered: usize,
}

impl Inner {
    fn transition(&mut self, state: BreakerState, reason: String, at: DateTime<Utc>) {
        self.state = state;
        self.events.push(BreakerEvent { state, reason, at });
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Active,
                atr_history: VecDeque::new(),
                loss_streak: VecDeque::new(),
                daily: None,
                events: Vec::new(),
                delivered: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// True only in `Active`.
    pub fn can_trade(&self) -> bool {
        self.state() == BreakerState::Active
    }

    /// Feeds the latest ATR. Returns true if this sample started a halt.
    ///
    /// The sample is compared against the mean of the preceding window once
    /// `min_atr_samples` values are known.
    pub fn record_atr(&self, atr: Decimal, now: DateTime<Utc>) -> bool {
        let mut inner = self.lock();

        let spike = if inner.atr_history.len() >= self.config.min_atr_samples.max(1) {
            let sum: Decimal = inner.atr_history.iter().copied().sum();
            let mean = sum / Decimal::from(inner.atr_history.len());
            self.spike_reason(atr, mean)
        } else {
            None
        };

        inner.atr_history.push_back(atr);
        while inner.atr_history.len() > self.config.atr_window.max(1) {
            inner.atr_history.pop_front();
        }

        match (spike, inner.state) {
            (Some(reason), BreakerState::Active) => {
                let until = now + to_delta(self.config.cooldown());
                warn!(%atr, %until, reason = %reason, "volatility spike, trading halted");
                inner.transition(BreakerState::VolatilityHalt { until }, reason, now);
                true
            }
            _ => false,
        }
    }

    fn spike_reason(&self, atr: Decimal, mean: Decimal) -> Option<String> {
        if mean <= Decimal::ZERO {
            return None;
        }
        if let Some(mult) = self.config.volatility_multiplier {
            if atr > mean * mult {
                return Some(format!("ATR {} exceeds {}x rolling mean {}", atr, mult, mean.round_dp(8)));
            }
        }
        if let Some(pct) = self.config.volatility_percent {
            let threshold = mean * (Decimal::ONE + pct / Decimal::ONE_HUNDRED);
            if atr > threshold {
                return Some(format!("ATR {} exceeds rolling mean {} by more than {}%", atr, mean.round_dp(8), pct));
            }
        }
        None
    }

    /// Records a closed trade's realized PnL. Returns true if the breaker
    /// entered `KillSwitch` because of it.
    pub fn record_trade(&self, pnl: Decimal, equity: Decimal, now: DateTime<Utc>) -> bool {
        let mut inner = self.lock();

        let today = now.date_naive();
        let realized = match inner.daily {
            Some((date, total)) if date == today => total + pnl,
            _ => pnl,
        };
        inner.daily = Some((today, realized));

        if pnl < Decimal::ZERO {
            let horizon = now - to_delta(self.config.loss_window());
            while inner.loss_streak.front().is_some_and(|t| *t < horizon) {
                inner.loss_streak.pop_front();
            }
            inner.loss_streak.push_back(now);
        } else {
            inner.loss_streak.clear();
        }

        if inner.state == BreakerState::KillSwitch {
            return false;
        }

        let streak = inner.loss_streak.len();
        if streak >= self.config.max_consecutive_losses {
            let reason = format!(
                "{} consecutive losing trades within {:?}",
                streak,
                self.config.loss_window()
            );
            error!(streak, reason = %reason, "circuit breaker tripped");
            inner.transition(BreakerState::KillSwitch, reason, now);
            return true;
        }

        let limit = equity * self.config.max_daily_loss_percent / Decimal::ONE_HUNDRED;
        if realized < Decimal::ZERO && -realized > limit {
            let reason = format!(
                "daily realized loss {} exceeds {}% of equity {} (limit {})",
                -realized, self.config.max_daily_loss_percent, equity, limit
            );
            error!(%realized, %limit, "circuit breaker tripped on daily loss");
            inner.transition(BreakerState::KillSwitch, reason, now);
            return true;
        }

        false
    }

    /// Realized PnL accumulated for the UTC day of `now`.
    pub fn realized_today(&self, now: DateTime<Utc>) -> Decimal {
        match self.lock().daily {
            Some((date, total)) if date == now.date_naive() => total,
            _ => Decimal::ZERO,
        }
    }

    /// Leaves `VolatilityHalt` once the cooldown has elapsed. An early call
    /// changes nothing.
    pub fn try_recover(&self, now: DateTime<Utc>) -> RecoveryOutcome {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Active => RecoveryOutcome::NotHalted,
            BreakerState::KillSwitch => RecoveryOutcome::ManualResetRequired,
            BreakerState::VolatilityHalt { until } if now < until => RecoveryOutcome::NotReady {
                remaining: (until - now).to_std().unwrap_or_default(),
            },
            BreakerState::VolatilityHalt { .. } => {
                info!("volatility cooldown elapsed, trading resumed");
                inner.transition(BreakerState::Active, "cooldown elapsed".to_string(), now);
                RecoveryOutcome::Recovered
            }
        }
    }

    /// Forces `KillSwitch` from any other state. Returns false if already there.
    pub fn trip(&self, reason: &str, now: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        if inner.state == BreakerState::KillSwitch {
            return false;
        }
        error!(reason = %reason, "circuit breaker tripped");
        inner.transition(BreakerState::KillSwitch, reason.to_string(), now);
        true
    }

    /// Operator action: returns to `Active` from any halted state and clears
    /// the loss streak. Returns false if already active.
    pub fn manual_reset(&self, reason: &str, now: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        if inner.state == BreakerState::Active {
            return false;
        }
        inner.loss_streak.clear();
        warn!(reason = %reason, from = %inner.state, "circuit breaker manually reset");
        inner.transition(BreakerState::Active, format!("manual reset: {}", reason), now);
        true
    }

    /// Full transition history, oldest first.
    pub fn events(&self) -> Vec<BreakerEvent> {
        self.lock().events.clone()
    }

    /// Events recorded since the previous call.
    pub fn take_new_events(&self) -> Vec<BreakerEvent> {
        let mut inner = self.lock();
        let new = inner.events[inner.delivered..].to_vec();
        inner.delivered = inner.events.len();
        new
    }
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}
