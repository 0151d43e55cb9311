// =============================================================================
// Strategies — pure evaluators over tick windows and market features
// =============================================================================
//
// Each strategy is a pure function of the observable window and feature
// snapshot: no strategy touches the risk gate or the upstream. Three trading
// personalities ship in-tree:
//
//   momentum   — follows sustained directional moves.
//   mean_revert — fades overextended moves back to the mean.
//   flow_scalp — micro-structure entries from imbalance and momentum.
// =============================================================================

use std::sync::Arc;

use crate::market::ring::Window;
use crate::market::FeatureSnapshot;
use crate::types::Direction;

/// Evaluation result. `signal: None` means stand aside.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub signal: Option<Direction>,
    pub confidence: f64,
    pub stake_multiplier: f64,
    pub reasons: Vec<String>,
}

impl Evaluation {
    pub fn stand_aside(reason: impl Into<String>) -> Self {
        Self {
            signal: None,
            confidence: 0.0,
            stake_multiplier: 1.0,
            reasons: vec![reason.into()],
        }
    }

    fn enter(direction: Direction, confidence: f64, reasons: Vec<String>) -> Self {
        Self {
            signal: Some(direction),
            confidence: confidence.clamp(0.0, 1.0),
            stake_multiplier: 1.0,
            reasons,
        }
    }
}

/// A strategy evaluator. `required_ticks` gates evaluation until the window
/// is full.
pub trait Strategy: Send + Sync {
    fn id(&self) -> &str;
    fn required_ticks(&self) -> usize;
    fn evaluate(&self, window: &Window<'_>, features: Option<&FeatureSnapshot>) -> Evaluation;
}

/// Resolve a strategy by its persisted id.
pub fn strategy_by_id(id: &str) -> Option<Arc<dyn Strategy>> {
    match id {
        "momentum" => Some(Arc::new(Momentum::default())),
        "mean_revert" => Some(Arc::new(MeanReversion::default())),
        "flow_scalp" => Some(Arc::new(FlowScalp::default())),
        _ => None,
    }
}

/// Ids accepted by [`strategy_by_id`].
pub fn available_strategies() -> &'static [&'static str] {
    &["momentum", "mean_revert", "flow_scalp"]
}

// ---------------------------------------------------------------------------
// Momentum
// ---------------------------------------------------------------------------

/// Follows a sustained directional move: last price beyond the window SMA by
/// a fractional threshold.
pub struct Momentum {
    window: usize,
    threshold: f64,
}

impl Default for Momentum {
    fn default() -> Self {
        Self {
            window: 20,
            threshold: 0.0005,
        }
    }
}

impl Strategy for Momentum {
    fn id(&self) -> &str {
        "momentum"
    }

    fn required_ticks(&self) -> usize {
        self.window
    }

    fn evaluate(&self, window: &Window<'_>, _features: Option<&FeatureSnapshot>) -> Evaluation {
        let n = window.len();
        if n < self.window {
            return Evaluation::stand_aside("window not full");
        }

        let sma: f64 = window.quotes().sum::<f64>() / n as f64;
        let Some(last) = window.last().map(|t| t.quote) else {
            return Evaluation::stand_aside("empty window");
        };
        if sma == 0.0 {
            return Evaluation::stand_aside("degenerate prices");
        }

        let deviation = (last - sma) / sma;
        if deviation > self.threshold {
            Evaluation::enter(
                Direction::Call,
                (deviation / (self.threshold * 4.0)).abs(),
                vec![format!("last {:.5} above sma {:.5}", last, sma)],
            )
        } else if deviation < -self.threshold {
            Evaluation::enter(
                Direction::Put,
                (deviation / (self.threshold * 4.0)).abs(),
                vec![format!("last {:.5} below sma {:.5}", last, sma)],
            )
        } else {
            Evaluation::stand_aside("no sustained move")
        }
    }
}

// ---------------------------------------------------------------------------
// Mean reversion
// ---------------------------------------------------------------------------

/// Fades z-score extremes back toward the window mean.
pub struct MeanReversion {
    window: usize,
    z_entry: f64,
}

impl Default for MeanReversion {
    fn default() -> Self {
        Self {
            window: 30,
            z_entry: 2.0,
        }
    }
}

impl Strategy for MeanReversion {
    fn id(&self) -> &str {
        "mean_revert"
    }

    fn required_ticks(&self) -> usize {
        self.window
    }

    fn evaluate(&self, window: &Window<'_>, _features: Option<&FeatureSnapshot>) -> Evaluation {
        let n = window.len();
        if n < self.window {
            return Evaluation::stand_aside("window not full");
        }

        let mean: f64 = window.quotes().sum::<f64>() / n as f64;
        let variance: f64 =
            window.quotes().map(|q| (q - mean).powi(2)).sum::<f64>() / n as f64;
        let std_dev = variance.sqrt();
        if std_dev <= f64::EPSILON {
            return Evaluation::stand_aside("flat market");
        }

        let Some(last) = window.last().map(|t| t.quote) else {
            return Evaluation::stand_aside("empty window");
        };
        let z = (last - mean) / std_dev;

        if z >= self.z_entry {
            Evaluation::enter(
                Direction::Put,
                (z.abs() / (self.z_entry * 2.0)).min(1.0),
                vec![format!("z-score {:.2} overextended high", z)],
            )
        } else if z <= -self.z_entry {
            Evaluation::enter(
                Direction::Call,
                (z.abs() / (self.z_entry * 2.0)).min(1.0),
                vec![format!("z-score {:.2} overextended low", z)],
            )
        } else {
            Evaluation::stand_aside("inside the band")
        }
    }
}

// ---------------------------------------------------------------------------
// Flow scalp
// ---------------------------------------------------------------------------

/// Micro-structure entries: strong order-flow imbalance confirmed by
/// non-opposing momentum. Sizes down on weaker imbalance.
pub struct FlowScalp {
    min_window: usize,
    imbalance_entry: f64,
}

impl Default for FlowScalp {
    fn default() -> Self {
        Self {
            min_window: 5,
            imbalance_entry: 0.6,
        }
    }
}

impl Strategy for FlowScalp {
    fn id(&self) -> &str {
        "flow_scalp"
    }

    fn required_ticks(&self) -> usize {
        self.min_window
    }

    fn evaluate(&self, window: &Window<'_>, features: Option<&FeatureSnapshot>) -> Evaluation {
        if window.len() < self.min_window {
            return Evaluation::stand_aside("window not full");
        }
        let Some(features) = features else {
            return Evaluation::stand_aside("no market features");
        };
        let Some(imbalance) = features.imbalance else {
            return Evaluation::stand_aside("no imbalance reading");
        };

        let momentum = features.momentum.unwrap_or(0.0);

        if imbalance >= self.imbalance_entry && momentum >= 0.0 {
            let mut eval = Evaluation::enter(
                Direction::Call,
                imbalance,
                vec![format!("imbalance {:.2} with momentum {:.4}", imbalance, momentum)],
            );
            eval.stake_multiplier = if imbalance > 0.8 { 1.0 } else { 0.5 };
            eval
        } else if imbalance <= -self.imbalance_entry && momentum <= 0.0 {
            let mut eval = Evaluation::enter(
                Direction::Put,
                imbalance.abs(),
                vec![format!("imbalance {:.2} with momentum {:.4}", imbalance, momentum)],
            );
            eval.stake_multiplier = if imbalance < -0.8 { 1.0 } else { 0.5 };
            eval
        } else {
            Evaluation::stand_aside("flow not one-sided")
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::ring::{QuoteRing, Tick};
    use crate::market::FeatureMode;
    use std::time::Instant;

    fn ring_of(quotes: &[f64]) -> QuoteRing {
        let mut ring = QuoteRing::new(quotes.len().max(1));
        for (i, q) in quotes.iter().enumerate() {
            ring.push(Tick {
                symbol: "R_100".to_string(),
                epoch: i as i64,
                quote: *q,
                bid: None,
                ask: None,
                received: Instant::now(),
                received_at_ms: i as i64 * 1_000,
            });
        }
        ring
    }

    fn features(imbalance: Option<f64>, momentum: Option<f64>) -> FeatureSnapshot {
        FeatureSnapshot {
            mode: FeatureMode::Synthetic,
            mid: Some(100.0),
            spread: Some(0.1),
            imbalance,
            momentum,
            micro_price: None,
        }
    }

    #[test]
    fn registry_resolves_known_ids() {
        for id in available_strategies() {
            let s = strategy_by_id(id).unwrap();
            assert_eq!(&s.id(), id);
            assert!(s.required_ticks() > 0);
        }
        assert!(strategy_by_id("martingale").is_none());
    }

    #[test]
    fn momentum_signals_direction_of_move() {
        // Ramp up: last well above SMA.
        let up: Vec<f64> = (0..20).map(|i| 100.0 + i as f64 * 0.1).collect();
        let ring = ring_of(&up);
        let eval = Momentum::default().evaluate(&ring.window(20), None);
        assert_eq!(eval.signal, Some(Direction::Call));
        assert!(eval.confidence > 0.0);

        let down: Vec<f64> = (0..20).map(|i| 100.0 - i as f64 * 0.1).collect();
        let ring = ring_of(&down);
        let eval = Momentum::default().evaluate(&ring.window(20), None);
        assert_eq!(eval.signal, Some(Direction::Put));
    }

    #[test]
    fn momentum_stands_aside_on_flat_market() {
        let flat = vec![100.0; 20];
        let ring = ring_of(&flat);
        let eval = Momentum::default().evaluate(&ring.window(20), None);
        assert!(eval.signal.is_none());
    }

    #[test]
    fn momentum_requires_full_window() {
        let short = vec![100.0; 5];
        let ring = ring_of(&short);
        let eval = Momentum::default().evaluate(&ring.window(20), None);
        assert!(eval.signal.is_none());
    }

    #[test]
    fn mean_reversion_fades_extremes() {
        // 29 quiet quotes around 100, then a spike.
        let mut quotes: Vec<f64> = (0..29).map(|i| 100.0 + (i % 3) as f64 * 0.01).collect();
        quotes.push(101.0);
        let ring = ring_of(&quotes);
        let eval = MeanReversion::default().evaluate(&ring.window(30), None);
        assert_eq!(eval.signal, Some(Direction::Put));

        let mut quotes: Vec<f64> = (0..29).map(|i| 100.0 + (i % 3) as f64 * 0.01).collect();
        quotes.push(99.0);
        let ring = ring_of(&quotes);
        let eval = MeanReversion::default().evaluate(&ring.window(30), None);
        assert_eq!(eval.signal, Some(Direction::Call));
    }

    #[test]
    fn mean_reversion_ignores_flat_series() {
        let flat = vec![100.0; 30];
        let ring = ring_of(&flat);
        let eval = MeanReversion::default().evaluate(&ring.window(30), None);
        assert!(eval.signal.is_none());
    }

    #[test]
    fn flow_scalp_needs_confirming_momentum() {
        let quotes = vec![100.0, 100.1, 100.2, 100.3, 100.4];
        let ring = ring_of(&quotes);
        let strategy = FlowScalp::default();

        let eval = strategy.evaluate(&ring.window(5), Some(&features(Some(0.9), Some(0.001))));
        assert_eq!(eval.signal, Some(Direction::Call));
        assert_eq!(eval.stake_multiplier, 1.0);

        // Opposing momentum vetoes the entry.
        let eval = strategy.evaluate(&ring.window(5), Some(&features(Some(0.9), Some(-0.001))));
        assert!(eval.signal.is_none());

        // Weak imbalance halves the stake.
        let eval = strategy.evaluate(&ring.window(5), Some(&features(Some(0.7), Some(0.0))));
        assert_eq!(eval.signal, Some(Direction::Call));
        assert_eq!(eval.stake_multiplier, 0.5);
    }

    #[test]
    fn flow_scalp_stands_aside_without_features() {
        let quotes = vec![100.0; 5];
        let ring = ring_of(&quotes);
        let eval = FlowScalp::default().evaluate(&ring.window(5), None);
        assert!(eval.signal.is_none());
    }
}
