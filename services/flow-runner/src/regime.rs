//! Market regime classification
//!
//! Classifies the benchmark's recent behavior, optionally combined with an
//! implied-volatility index, into one of the coarse [`Regime`]s. Bad or thin
//! input never errors: it yields `mixed` with zero confidence.

use serde::{Deserialize, Serialize};

use crate::config::RegimeConfig;
use crate::types::Regime;

/// Classifier output
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeReading {
    pub regime: Regime,
    pub confidence: f64,
}

impl RegimeReading {
    pub fn mixed() -> Self {
        Self {
            regime: Regime::Mixed,
            confidence: 0.0,
        }
    }
}

impl Default for RegimeReading {
    fn default() -> Self {
        Self::mixed()
    }
}

/// Summary statistics over the lookback window
#[derive(Debug, Clone, Copy)]
struct WindowStats {
    return_pct: f64,
    drawdown_pct: f64,
    bar_vol_pct: f64,
}

pub struct RegimeClassifier {
    config: RegimeConfig,
}

impl RegimeClassifier {
    pub fn new(config: RegimeConfig) -> Self {
        Self { config }
    }

    /// Classify from benchmark closes (oldest first) and an optional vol index
    pub fn classify(&self, closes: &[f64], vol_index: Option<f64>) -> RegimeReading {
        let vol_index = vol_index.filter(|v| v.is_finite() && *v >= 0.0);
        match self.window_stats(closes) {
            Some(stats) => self.from_stats(stats, vol_index),
            None => match vol_index {
                // Index alone still says something, at reduced confidence
                Some(vix) => {
                    let mut reading = self.from_vol_index(vix);
                    reading.confidence *= 0.5;
                    reading
                }
                None => RegimeReading::mixed(),
            },
        }
    }

    fn window_stats(&self, closes: &[f64]) -> Option<WindowStats> {
        let lookback = self.config.lookback_bars.max(2);
        let start = closes.len().saturating_sub(lookback);
        let window = &closes[start..];

        if window.len() < self.config.min_bars.max(2)
            || window.iter().any(|p| !p.is_finite() || *p <= 0.0)
        {
            return None;
        }

        let first = window[0];
        let last = window[window.len() - 1];
        let return_pct = (last / first - 1.0) * 100.0;

        let peak = window.iter().copied().fold(f64::MIN, f64::max);
        let drawdown_pct = (1.0 - last / peak) * 100.0;

        let returns: Vec<f64> = window.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance =
            returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
        let bar_vol_pct = variance.sqrt() * 100.0;

        let stats = WindowStats {
            return_pct,
            drawdown_pct,
            bar_vol_pct,
        };
        if stats.return_pct.is_finite() && stats.drawdown_pct.is_finite() && bar_vol_pct.is_finite()
        {
            Some(stats)
        } else {
            None
        }
    }

    fn from_stats(&self, stats: WindowStats, vix: Option<f64>) -> RegimeReading {
        let cfg = &self.config;
        let vix_ratio = |threshold: f64| vix.map(|v| v / threshold).unwrap_or(0.0);

        // Panic: sharp drawdown, extreme implied vol, or violent selling
        let panic_strength = (stats.drawdown_pct / cfg.panic_drawdown_pct)
            .max(vix_ratio(cfg.panic_vol_index));
        let violent_selloff = stats.bar_vol_pct >= cfg.high_vol_bar_pct * 2.0
            && stats.return_pct <= cfg.risk_off_return_pct;
        if panic_strength >= 1.0 || violent_selloff {
            return RegimeReading {
                regime: Regime::Panic,
                confidence: confidence_from(panic_strength.max(1.0)),
            };
        }

        let risk_off_strength = (stats.return_pct / cfg.risk_off_return_pct)
            .max(vix_ratio(cfg.risk_off_vol_index))
            .max(stats.bar_vol_pct / cfg.high_vol_bar_pct);
        if risk_off_strength >= 1.0 {
            return RegimeReading {
                regime: Regime::RiskOff,
                confidence: confidence_from(risk_off_strength),
            };
        }

        let calm = vix.map_or(true, |v| v <= cfg.risk_on_max_vol_index);
        if stats.return_pct >= cfg.risk_on_return_pct && calm {
            return RegimeReading {
                regime: Regime::RiskOn,
                confidence: confidence_from(stats.return_pct / cfg.risk_on_return_pct),
            };
        }

        // Neutral is most certain when the window is flat
        let drift = (stats.return_pct / cfg.risk_on_return_pct).abs().min(1.0);
        RegimeReading {
            regime: Regime::Neutral,
            confidence: (1.0 - 0.5 * drift).clamp(0.5, 1.0),
        }
    }

    fn from_vol_index(&self, vix: f64) -> RegimeReading {
        let cfg = &self.config;
        if vix >= cfg.panic_vol_index {
            RegimeReading {
                regime: Regime::Panic,
                confidence: confidence_from(vix / cfg.panic_vol_index),
            }
        } else if vix >= cfg.risk_off_vol_index {
            RegimeReading {
                regime: Regime::RiskOff,
                confidence: confidence_from(vix / cfg.risk_off_vol_index),
            }
        } else if vix <= cfg.risk_on_max_vol_index {
            RegimeReading {
                regime: Regime::RiskOn,
                confidence: 0.5,
            }
        } else {
            RegimeReading {
                regime: Regime::Neutral,
                confidence: 0.5,
            }
        }
    }
}

/// Map a threshold ratio (>= 1 once triggered) onto [0.5, 1.0]
fn confidence_from(ratio: f64) -> f64 {
    if !ratio.is_finite() {
        return 0.5;
    }
    (0.5 + 0.5 * (ratio - 1.0).clamp(0.0, 1.0)).clamp(0.5, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> RegimeClassifier {
        RegimeClassifier::new(RegimeConfig::default())
    }

    fn ramp(start: f64, step_pct: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| start * (1.0 + step_pct / 100.0).powi(i as i32))
            .collect()
    }

    #[test]
    fn test_insufficient_data_is_mixed() {
        let reading = classifier().classify(&[100.0, 101.0], None);
        assert_eq!(reading, RegimeReading::mixed());
    }

    #[test]
    fn test_non_finite_data_is_mixed() {
        let mut closes = ramp(100.0, 0.05, 20);
        closes[7] = f64::NAN;
        assert_eq!(classifier().classify(&closes, None).regime, Regime::Mixed);
    }

    #[test]
    fn test_steady_rally_is_risk_on() {
        let closes = ramp(100.0, 0.05, 30);
        let reading = classifier().classify(&closes, Some(14.0));
        assert_eq!(reading.regime, Regime::RiskOn);
        assert!(reading.confidence >= 0.5);
    }

    #[test]
    fn test_rally_with_high_vix_is_not_risk_on() {
        let closes = ramp(100.0, 0.05, 30);
        let reading = classifier().classify(&closes, Some(22.0));
        assert_eq!(reading.regime, Regime::Neutral);
    }

    #[test]
    fn test_steady_decline_is_risk_off() {
        let closes = ramp(100.0, -0.06, 30);
        assert_eq!(classifier().classify(&closes, None).regime, Regime::RiskOff);
    }

    #[test]
    fn test_crash_is_panic() {
        let mut closes = ramp(100.0, 0.01, 25);
        closes.extend(ramp(100.0, -1.2, 5));
        assert_eq!(classifier().classify(&closes, None).regime, Regime::Panic);
    }

    #[test]
    fn test_vix_only_reading_has_reduced_confidence() {
        let reading = classifier().classify(&[], Some(40.0));
        assert_eq!(reading.regime, Regime::Panic);
        assert!(reading.confidence <= 0.5);
    }

    #[test]
    fn test_flat_market_is_neutral() {
        let closes = vec![100.0; 30];
        let reading = classifier().classify(&closes, Some(20.0));
        assert_eq!(reading.regime, Regime::Neutral);
        assert_eq!(reading.confidence, 1.0);
    }
}
