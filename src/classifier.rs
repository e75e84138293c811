//! BPM risk classification
//!
//! Maps a heart-rate reading onto one of five risk tiers. The low side
//! treats the threshold itself as the riskier tier (40 is critical, 50 is
//! a warning); the high side keeps the warning threshold normal (100) and
//! the critical threshold critical (150).

use serde::Deserialize;

use crate::models::RiskLevel;

/// Classification thresholds (beats per minute)
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Thresholds {
    pub critical_low: f64,
    pub warning_low: f64,
    pub warning_high: f64,
    pub critical_high: f64,
}

impl Thresholds {
    pub const DEFAULT_CRITICAL_LOW: f64 = 40.0;
    pub const DEFAULT_WARNING_LOW: f64 = 50.0;
    pub const DEFAULT_WARNING_HIGH: f64 = 100.0;
    pub const DEFAULT_CRITICAL_HIGH: f64 = 150.0;

    /// Thresholds must be strictly increasing from critical_low to critical_high
    pub fn is_ordered(&self) -> bool {
        self.critical_low < self.warning_low
            && self.warning_low < self.warning_high
            && self.warning_high < self.critical_high
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            critical_low: Self::DEFAULT_CRITICAL_LOW,
            warning_low: Self::DEFAULT_WARNING_LOW,
            warning_high: Self::DEFAULT_WARNING_HIGH,
            critical_high: Self::DEFAULT_CRITICAL_HIGH,
        }
    }
}

/// Classify a BPM value. First match wins.
pub fn classify(bpm: f64, thresholds: &Thresholds) -> RiskLevel {
    if bpm <= thresholds.critical_low {
        RiskLevel::CriticalLow
    } else if bpm <= thresholds.warning_low {
        RiskLevel::WarningLow
    } else if bpm >= thresholds.critical_high {
        RiskLevel::CriticalHigh
    } else if bpm > thresholds.warning_high {
        RiskLevel::WarningHigh
    } else {
        RiskLevel::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(bpm: f64) -> RiskLevel {
        classify(bpm, &Thresholds::default())
    }

    #[test]
    fn test_low_boundaries() {
        assert_eq!(level(0.0), RiskLevel::CriticalLow);
        assert_eq!(level(40.0), RiskLevel::CriticalLow);
        assert_eq!(level(41.0), RiskLevel::WarningLow);
        assert_eq!(level(50.0), RiskLevel::WarningLow);
        assert_eq!(level(51.0), RiskLevel::Normal);
    }

    #[test]
    fn test_high_boundaries() {
        assert_eq!(level(100.0), RiskLevel::Normal);
        assert_eq!(level(101.0), RiskLevel::WarningHigh);
        assert_eq!(level(149.0), RiskLevel::WarningHigh);
        assert_eq!(level(150.0), RiskLevel::CriticalHigh);
        assert_eq!(level(300.0), RiskLevel::CriticalHigh);
    }

    #[test]
    fn test_total_over_out_of_range_values() {
        assert_eq!(level(-20.0), RiskLevel::CriticalLow);
        assert_eq!(level(1_000.0), RiskLevel::CriticalHigh);
    }

    #[test]
    fn test_custom_thresholds() {
        let thresholds = Thresholds {
            critical_low: 30.0,
            warning_low: 45.0,
            warning_high: 120.0,
            critical_high: 180.0,
        };

        assert_eq!(classify(40.0, &thresholds), RiskLevel::WarningLow);
        assert_eq!(classify(110.0, &thresholds), RiskLevel::Normal);
        assert_eq!(classify(150.0, &thresholds), RiskLevel::WarningHigh);
    }

    #[test]
    fn test_threshold_ordering() {
        assert!(Thresholds::default().is_ordered());

        let inverted = Thresholds {
            warning_high: 160.0,
            ..Thresholds::default()
        };
        assert!(!inverted.is_ordered());
    }
}
