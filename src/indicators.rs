// =============================================================================
// Tick-series indicators — volatility measures for the strategy guard
// =============================================================================
//
// Binary-options symbols stream bare quotes, so the true range of a tick
// degenerates to |Δquote|. The ATR here is Wilder's smoothing over those
// absolute deltas, normalised by the last quote so thresholds are unitless
// fractions.
//
//   TR_i   = |q_i - q_{i-1}|
//   ATR_0  = SMA of first `period` TR values
//   ATR_t  = (ATR_{t-1} * (period - 1) + TR_t) / period
//   result = ATR / q_last
// =============================================================================

/// Normalised tick ATR over `quotes` (oldest first).
///
/// Returns `None` when `period` is zero, there are fewer than `period + 1`
/// quotes, or any intermediate value is non-finite.
pub fn tick_atr(quotes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || quotes.len() < period + 1 {
        return None;
    }

    let mut tr_values: Vec<f64> = Vec::with_capacity(quotes.len() - 1);
    for pair in quotes.windows(2) {
        tr_values.push((pair[1] - pair[0]).abs());
    }

    if tr_values.len() < period {
        return None;
    }

    let mut atr: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    for tr in &tr_values[period..] {
        atr = (atr * (period as f64 - 1.0) + tr) / period as f64;
    }

    let last = *quotes.last()?;
    if !atr.is_finite() || last == 0.0 {
        return None;
    }
    Some(atr / last.abs())
}
