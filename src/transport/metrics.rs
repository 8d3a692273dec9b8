//! Transport scoring and rolling metrics

use std::collections::VecDeque;
use std::time::Duration;

use crate::config::TransportConfig;
use crate::transport::{ConnectionQuality, TransportMetrics};

/// Result of one probe or handshake
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    Success(Duration),
    Failure,
}

/// Fixed-size window of probe outcomes for one transport
#[derive(Debug, Clone)]
pub struct MetricsWindow {
    capacity: usize,
    outcomes: VecDeque<ProbeOutcome>,
}

impl MetricsWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            outcomes: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, outcome: ProbeOutcome) {
        self.outcomes.push_back(outcome);
        while self.outcomes.len() > self.capacity {
            self.outcomes.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Healthy needs at least one outcome and a success rate at the threshold
    pub fn metrics(&self, healthy_success_rate: f64) -> TransportMetrics {
        if self.outcomes.is_empty() {
            return TransportMetrics::unhealthy();
        }

        let mut successes = 0usize;
        let mut latency_total = 0.0;
        for outcome in &self.outcomes {
            if let ProbeOutcome::Success(latency) = outcome {
                successes += 1;
                latency_total += latency.as_secs_f64() * 1000.0;
            }
        }

        let success_rate = successes as f64 / self.outcomes.len() as f64;
        let average_latency_ms = if successes > 0 {
            latency_total / successes as f64
        } else {
            0.0
        };

        TransportMetrics {
            success_rate,
            average_latency_ms,
            is_healthy: successes > 0 && success_rate >= healthy_success_rate,
        }
    }
}

/// Weighted quality score; higher is better
pub fn score(metrics: &TransportMetrics, config: &TransportConfig) -> f64 {
    let ceiling = config.latency_ceiling_ms.max(1.0);
    let latency = metrics.average_latency_ms.clamp(0.0, ceiling);
    let latency_component = 1.0 - latency / ceiling;
    config.success_weight * metrics.success_rate.clamp(0.0, 1.0)
        + config.latency_weight * latency_component
}

pub fn quality_for_latency(latency_ms: f64, config: &TransportConfig) -> ConnectionQuality {
    if !latency_ms.is_finite() || latency_ms < 0.0 {
        ConnectionQuality::Unknown
    } else if latency_ms < config.excellent_latency_ms {
        ConnectionQuality::Excellent
    } else if latency_ms < config.good_latency_ms {
        ConnectionQuality::Good
    } else if latency_ms < config.fair_latency_ms {
        ConnectionQuality::Fair
    } else {
        ConnectionQuality::Poor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_metrics() {
        let mut window = MetricsWindow::new(4);
        assert!(!window.metrics(0.5).is_healthy);

        window.push(ProbeOutcome::Success(Duration::from_millis(10)));
        window.push(ProbeOutcome::Success(Duration::from_millis(30)));
        window.push(ProbeOutcome::Failure);
        window.push(ProbeOutcome::Success(Duration::from_millis(20)));

        let metrics = window.metrics(0.5);
        assert!((metrics.success_rate - 0.75).abs() < 1e-9);
        assert!((metrics.average_latency_ms - 20.0).abs() < 1e-9);
        assert!(metrics.is_healthy);

        // first success rolls off
        window.push(ProbeOutcome::Failure);
        window.push(ProbeOutcome::Failure);
        let metrics = window.metrics(0.5);
        assert_eq!(window.len(), 4);
        assert!((metrics.success_rate - 0.25).abs() < 1e-9);
        assert!(!metrics.is_healthy);
    }

    #[test]
    fn test_score_prefers_reliability_then_latency() {
        let config = TransportConfig::default();
        let reliable = TransportMetrics::healthy(1.0, 100.0);
        let flaky = TransportMetrics::healthy(0.6, 10.0);
        assert!(score(&reliable, &config) > score(&flaky, &config));

        let fast = TransportMetrics::healthy(1.0, 20.0);
        assert!(score(&fast, &config) > score(&reliable, &config));

        let slow = TransportMetrics::healthy(1.0, 5_000.0);
        assert!((score(&slow, &config) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_quality_bands() {
        let config = TransportConfig::default();
        assert_eq!(quality_for_latency(10.0, &config), ConnectionQuality::Excellent);
        assert_eq!(quality_for_latency(50.0, &config), ConnectionQuality::Good);
        assert_eq!(quality_for_latency(150.0, &config), ConnectionQuality::Fair);
        assert_eq!(quality_for_latency(200.0, &config), ConnectionQuality::Poor);
        assert_eq!(quality_for_latency(f64::NAN, &config), ConnectionQuality::Unknown);
    }
}
