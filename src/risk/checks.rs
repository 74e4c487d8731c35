use rust_decimal::Decimal;
use std::fmt;

use crate::config::LimitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckKind {
    Leverage,
    Notional,
    DailyLoss,
    Drawdown,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckKind::Leverage => write!(f, "leverage"),
            CheckKind::Notional => write!(f, "notional"),
            CheckKind::DailyLoss => write!(f, "daily_loss_percent"),
            CheckKind::Drawdown => write!(f, "drawdown_percent"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Outcome of one check with the numbers behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub kind: CheckKind,
    pub value: Decimal,
    pub limit: Decimal,
    /// `None` when the check passed.
    pub severity: Option<Severity>,
}

impl CheckResult {
    pub fn passed(&self) -> bool {
        self.severity.is_none()
    }

    /// Grades `value` against `config`: pass at or under the limit,
    /// critical above `limit * critical_multiplier`, warning in between.
    pub(crate) fn grade(kind: CheckKind, value: Decimal, config: &LimitConfig) -> Self {
        let severity = if value <= config.limit {
            None
        } else if value > config.limit * config.critical_multiplier
            || config.critical_multiplier <= Decimal::ONE
        {
            Some(Severity::Critical)
        } else {
            Some(Severity::Warning)
        };

        Self {
            kind,
            value,
            limit: config.limit,
            severity,
        }
    }
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.severity {
            None => write!(f, "{} {} <= {} ok", self.kind, self.value, self.limit),
            Some(sev) => write!(
                f,
                "{} {} exceeds limit {} ({})",
                self.kind,
                self.value.round_dp(4),
                self.limit,
                sev
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::d;

    #[test]
    fn test_grade_boundaries() {
        let cfg = LimitConfig::new(d("10"), d("2"));
        assert!(CheckResult::grade(CheckKind::Leverage, d("10"), &cfg).passed());
        assert_eq!(
            CheckResult::grade(CheckKind::Leverage, d("15"), &cfg).severity,
            Some(Severity::Warning)
        );
        assert_eq!(
            CheckResult::grade(CheckKind::Leverage, d("20"), &cfg).severity,
            Some(Severity::Warning)
        );
        assert_eq!(
            CheckResult::grade(CheckKind::Leverage, d("20.01"), &cfg).severity,
            Some(Severity::Critical)
        );
    }

    #[test]
    fn test_unit_multiplier_makes_every_breach_critical() {
        let cfg = LimitConfig::new(d("5"), Decimal::ONE);
        assert_eq!(
            CheckResult::grade(CheckKind::DailyLoss, d("5.01"), &cfg).severity,
            Some(Severity::Critical)
        );
    }

    #[test]
    fn test_display_carries_numbers() {
        let cfg = LimitConfig::new(d("10"), d("2"));
        let r = CheckResult::grade(CheckKind::Leverage, d("25"), &cfg);
        assert_eq!(r.to_string(), "leverage 25 exceeds limit 10 (critical)");
    }
}
