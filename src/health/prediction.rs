//! Rule-based health prediction
//!
//! Deterministic and explainable: the same window always yields the same
//! prediction, and every risk factor maps to a fixed recommendation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::HealthConfig;

/// Expected short-term behaviour of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stability {
    Stable,
    Degrading,
    Unstable,
}

/// Named risk conditions, declared from most to least severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    FrequentErrors,
    HighLatency,
    RisingLatency,
    LatencySpikes,
    FrequentUpgrades,
}

impl RiskFactor {
    pub fn recommendation(&self) -> &'static str {
        match self {
            RiskFactor::FrequentErrors => {
                "Connection errors are frequent; check Wi-Fi signal strength or switch to USB"
            }
            RiskFactor::HighLatency => {
                "Latency is high; move closer to the router or use a USB connection"
            }
            RiskFactor::RisingLatency => "Latency is trending upward; the network may be congested",
            RiskFactor::LatencySpikes => {
                "Latency spikes detected; pause bandwidth-heavy apps on the same network"
            }
            RiskFactor::FrequentUpgrades => {
                "The transport keeps changing; pin a single connection type in settings"
            }
        }
    }
}

/// Derived assessment, recomputed on every sample
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthPrediction {
    pub avg_latency_ms: f64,
    pub predicted_stability: Stability,
    pub risk_factors: BTreeSet<RiskFactor>,
    /// Ordered by severity of the risk factor they address
    pub recommendations: Vec<String>,
    pub error_rate: f64,
    pub sample_count: usize,
}

/// What the predictor looks at
#[derive(Debug, Clone, Copy)]
pub struct PredictionInput<'a> {
    /// Retained latency window, oldest first
    pub latencies: &'a [f64],
    /// Samples inside the error-rate window
    pub recent_samples: usize,
    /// Errors inside the error-rate window
    pub recent_errors: usize,
    pub transport_upgrades: u32,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Errors per sample; errors with no samples count against a single sample
pub fn error_rate(errors: usize, samples: usize) -> f64 {
    errors as f64 / samples.max(1) as f64
}

/// Last quartile of the window averages higher than the first quartile
fn is_rising(latencies: &[f64]) -> bool {
    let quarter = latencies.len() / 4;
    if quarter == 0 {
        return false;
    }
    let head = mean(&latencies[..quarter]);
    let tail = mean(&latencies[latencies.len() - quarter..]);
    tail > head
}

pub fn predict(input: PredictionInput<'_>, config: &HealthConfig) -> HealthPrediction {
    let avg = mean(input.latencies);
    let rate = error_rate(input.recent_errors, input.recent_samples);
    let rising = is_rising(input.latencies);

    let predicted_stability = if avg < config.stable_latency_ms && rate < config.error_rate_threshold {
        Stability::Stable
    } else if rising {
        Stability::Degrading
    } else {
        Stability::Unstable
    };

    let mut risk_factors = BTreeSet::new();
    if input.recent_errors > 0 && rate >= config.error_rate_threshold {
        risk_factors.insert(RiskFactor::FrequentErrors);
    }
    if avg >= config.high_latency_ms {
        risk_factors.insert(RiskFactor::HighLatency);
    }
    if rising {
        risk_factors.insert(RiskFactor::RisingLatency);
    }
    if input.latencies.len() >= 4 && avg > 0.0 {
        let peak = input.latencies.iter().cloned().fold(f64::MIN, f64::max);
        if peak > avg * config.spike_factor {
            risk_factors.insert(RiskFactor::LatencySpikes);
        }
    }
    if input.transport_upgrades >= config.frequent_upgrades {
        risk_factors.insert(RiskFactor::FrequentUpgrades);
    }

    let recommendations = risk_factors
        .iter()
        .map(|factor| factor.recommendation().to_string())
        .collect();

    HealthPrediction {
        avg_latency_ms: avg,
        predicted_stability,
        risk_factors,
        recommendations,
        error_rate: rate,
        sample_count: input.latencies.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(latencies: &[f64], errors: usize, upgrades: u32) -> HealthPrediction {
        predict(
            PredictionInput {
                latencies,
                recent_samples: latencies.len(),
                recent_errors: errors,
                transport_upgrades: upgrades,
            },
            &HealthConfig::default(),
        )
    }

    #[test]
    fn test_stable_low_latency() {
        let prediction = run(&[20.0, 25.0, 30.0, 22.0], 0, 0);
        assert_eq!(prediction.predicted_stability, Stability::Stable);
        assert!((prediction.avg_latency_ms - 24.25).abs() < 1e-9);
        assert!(prediction.risk_factors.is_empty());
        assert!(prediction.recommendations.is_empty());
    }

    #[test]
    fn test_rising_latency_is_degrading() {
        let prediction = run(&[80.0, 90.0, 100.0, 110.0, 150.0, 160.0, 170.0, 180.0], 0, 0);
        assert_eq!(prediction.predicted_stability, Stability::Degrading);
        assert!(prediction.risk_factors.contains(&RiskFactor::RisingLatency));
    }

    #[test]
    fn test_flat_high_latency_is_unstable() {
        let prediction = run(&[300.0; 8], 0, 0);
        assert_eq!(prediction.predicted_stability, Stability::Unstable);
        assert!(prediction.risk_factors.contains(&RiskFactor::HighLatency));
        assert!(!prediction.risk_factors.contains(&RiskFactor::RisingLatency));
    }

    #[test]
    fn test_errors_break_stability() {
        // 1 error in 3 samples is above the 10% threshold
        let prediction = run(&[20.0, 25.0, 30.0], 1, 0);
        assert_ne!(prediction.predicted_stability, Stability::Stable);
        assert!(prediction.risk_factors.contains(&RiskFactor::FrequentErrors));
    }

    #[test]
    fn test_recommendations_follow_severity() {
        let mut latencies = vec![250.0; 7];
        latencies.push(2_000.0);
        let prediction = run(&latencies, 5, 4);

        let factors: Vec<RiskFactor> = prediction.risk_factors.iter().cloned().collect();
        assert_eq!(
            factors,
            vec![
                RiskFactor::FrequentErrors,
                RiskFactor::HighLatency,
                RiskFactor::RisingLatency,
                RiskFactor::LatencySpikes,
                RiskFactor::FrequentUpgrades,
            ]
        );
        assert_eq!(prediction.recommendations.len(), 5);
        assert_eq!(
            prediction.recommendations[0],
            RiskFactor::FrequentErrors.recommendation()
        );
    }

    #[test]
    fn test_empty_window() {
        let prediction = run(&[], 0, 0);
        assert_eq!(prediction.avg_latency_ms, 0.0);
        assert_eq!(prediction.sample_count, 0);
        assert_eq!(prediction.predicted_stability, Stability::Stable);
    }

    #[test]
    fn test_error_rate_without_samples() {
        assert_eq!(error_rate(0, 0), 0.0);
        assert_eq!(error_rate(2, 0), 2.0);
        assert_eq!(error_rate(1, 4), 0.25);
    }
}
