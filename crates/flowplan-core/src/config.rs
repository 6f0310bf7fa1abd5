use crate::rational::{DISPLAY_DECIMALS, Rational};
use serde::{Deserialize, Serialize};

/// Engine tuning knobs. Every field has a default, so partial config files
/// are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Decimals shown when formatting rates for logs and reports.
    pub display_decimals: usize,
    /// The relevant-set walk may take `pin_count * iteration_cap_factor` steps.
    pub iteration_cap_factor: usize,
    /// Reject solutions with a negative rate.
    pub reject_negative: bool,
    /// Write flow annotations on links after each solve.
    pub annotate_flow: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            display_decimals: DISPLAY_DECIMALS,
            iteration_cap_factor: 1,
            reject_negative: true,
            annotate_flow: true,
        }
    }
}

impl SolverConfig {
    /// Format a rate with the configured number of decimals.
    pub fn format_rate(&self, rate: &Rational) -> String {
        if self.display_decimals == DISPLAY_DECIMALS {
            rate.decimal_string().to_string()
        } else {
            rate.format_decimal(self.display_decimals)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rational::ratio;

    #[test]
    fn defaults() {
        let c = SolverConfig::default();
        assert_eq!(c.display_decimals, 3);
        assert_eq!(c.iteration_cap_factor, 1);
        assert!(c.reject_negative);
        assert!(c.annotate_flow);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let c: SolverConfig = serde_json::from_str(r#"{"reject_negative": false}"#).unwrap();
        assert!(!c.reject_negative);
        assert_eq!(c.display_decimals, 3);
    }

    #[test]
    fn format_rate_uses_decimals() {
        let mut c = SolverConfig::default();
        assert_eq!(c.format_rate(&ratio(2, 3)), "0.667");
        c.display_decimals = 1;
        assert_eq!(c.format_rate(&ratio(2, 3)), "0.7");
    }
}
