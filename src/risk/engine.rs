use std::fmt;
use std::sync::Mutex;

use rust_decimal::Decimal;
use tracing::{info, warn};

use super::checks::{CheckKind, CheckResult, Severity};
use crate::config::RiskConfig;

/// Point-in-time inputs to one risk decision.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskStateSnapshot {
    pub account_balance: Decimal,
    /// Notional of positions already open.
    pub open_notional: Decimal,
    /// Notional of the order being considered; zero for monitoring passes.
    pub proposed_notional: Decimal,
    pub leverage: Decimal,
    pub realized_pnl_today: Decimal,
    pub current_equity: Decimal,
    /// Session peak supplied by the caller. When absent the engine's own
    /// tracker is used.
    pub peak_equity: Option<Decimal>,
}

impl RiskStateSnapshot {
    /// Builds a snapshot whose leverage is total notional over balance.
    pub fn from_account(
        account_balance: Decimal,
        open_notional: Decimal,
        proposed_notional: Decimal,
        realized_pnl_today: Decimal,
        current_equity: Decimal,
    ) -> Self {
        Self {
            account_balance,
            open_notional,
            proposed_notional,
            leverage: ratio(open_notional + proposed_notional, account_balance),
            realized_pnl_today,
            current_equity,
            peak_equity: None,
        }
    }
}

/// Outcome of an evaluation. Failing variants always carry the check that
/// drove them.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allow,
    /// Block this trade only.
    Deny {
        reason: CheckResult,
        other_failures: Vec<CheckResult>,
    },
    /// Halt all trading; the caller activates the kill switch.
    Stop {
        reason: CheckResult,
        other_failures: Vec<CheckResult>,
    },
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Decision::Stop { .. })
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allow => write!(f, "ALLOW"),
            Decision::Deny { reason, other_failures } => {
                write!(f, "DENY: {}", reason)?;
                for other in other_failures {
                    write!(f, "; {}", other)?;
                }
                Ok(())
            }
            Decision::Stop { reason, other_failures } => {
                write!(f, "STOP: {}", reason)?;
                for other in other_failures {
                    write!(f, "; {}", other)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskAssessment {
    pub decision: Decision,
    /// Every enabled check, in evaluation order.
    pub checks: Vec<CheckResult>,
}

/// Evaluates snapshots against [`RiskConfig`].
///
/// The only state kept between calls is the session peak equity used by the
/// drawdown check when the snapshot does not carry one.
pub struct RiskEngine {
    config: RiskConfig,
    peak_equity: Mutex<Option<Decimal>>,
}

impl RiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            peak_equity: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Session peak seen so far.
    pub fn peak_equity(&self) -> Option<Decimal> {
        *self.peak_equity.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Forgets the session peak (new session).
    pub fn reset_session(&self) {
        *self.peak_equity.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    /// Folds `equity` into the session peak and returns the peak.
    fn observe_equity(&self, equity: Decimal) -> Decimal {
        let mut peak = self.peak_equity.lock().unwrap_or_else(|p| p.into_inner());
        let next = peak.map_or(equity, |p| p.max(equity));
        *peak = Some(next);
        next
    }

    pub fn evaluate(&self, snapshot: &RiskStateSnapshot) -> RiskAssessment {
        let tracked_peak = self.observe_equity(snapshot.current_equity);
        let peak = snapshot.peak_equity.unwrap_or(tracked_peak);

        let cfg = &self.config;
        let mut checks = Vec::with_capacity(4);

        if cfg.leverage.enabled {
            checks.push(CheckResult::grade(CheckKind::Leverage, snapshot.leverage, &cfg.leverage));
        }
        if cfg.notional.enabled {
            let total = snapshot.open_notional + snapshot.proposed_notional;
            checks.push(CheckResult::grade(CheckKind::Notional, total, &cfg.notional));
        }
        if cfg.daily_loss_percent.enabled {
            let loss = (-snapshot.realized_pnl_today).max(Decimal::ZERO);
            let pct = ratio(loss, snapshot.account_balance) * Decimal::ONE_HUNDRED;
            checks.push(CheckResult::grade(CheckKind::DailyLoss, pct, &cfg.daily_loss_percent));
        }
        if cfg.drawdown_percent.enabled {
            let decline = (peak - snapshot.current_equity).max(Decimal::ZERO);
            let pct = ratio(decline, peak) * Decimal::ONE_HUNDRED;
            checks.push(CheckResult::grade(CheckKind::Drawdown, pct, &cfg.drawdown_percent));
        }

        let decision = decide(&checks);
        match &decision {
            Decision::Allow => {}
            Decision::Deny { .. } => info!(
                decision = %decision,
                balance = %snapshot.account_balance,
                open_notional = %snapshot.open_notional,
                proposed_notional = %snapshot.proposed_notional,
                "risk check denied"
            ),
            Decision::Stop { .. } => warn!(
                decision = %decision,
                balance = %snapshot.account_balance,
                equity = %snapshot.current_equity,
                peak = %peak,
                pnl_today = %snapshot.realized_pnl_today,
                "risk check requires stop"
            ),
        }

        RiskAssessment { decision, checks }
    }
}

fn decide(checks: &[CheckResult]) -> Decision {
    let failures: Vec<&CheckResult> = checks.iter().filter(|c| !c.passed()).collect();

    let critical = failures
        .iter()
        .position(|c| c.severity == Some(Severity::Critical));

    let primary = match critical.or(if failures.is_empty() { None } else { Some(0) }) {
        Some(i) => i,
        None => return Decision::Allow,
    };

    let reason = failures[primary].clone();
    let other_failures = failures
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != primary)
        .map(|(_, c)| (*c).clone())
        .collect();

    if critical.is_some() {
        Decision::Stop { reason, other_failures }
    } else {
        Decision::Deny { reason, other_failures }
    }
}

/// `num / den`, saturating to `Decimal::MAX` when the denominator is not
/// positive but the numerator is.
fn ratio(num: Decimal, den: Decimal) -> Decimal {
    if den > Decimal::ZERO {
        num / den
    } else if num > Decimal::ZERO {
        Decimal::MAX
    } else {
        Decimal::ZERO
    }
}
