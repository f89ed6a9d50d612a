// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// MACD line = EMA(fast) - EMA(slow)
// Signal line = EMA(signal_period) of the MACD line
// Histogram = MACD line - Signal line
//
// Default periods: 12 / 26 / 9.

use super::ema::calculate_ema;

/// Snapshot of the most recent MACD reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdResult {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the most recent MACD/signal/histogram triple.
///
/// Returns `None` when there isn't enough data for the slow EMA plus the
/// signal-line EMA, or when any intermediate value is non-finite.
pub fn calculate_macd(
    closes: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> Option<MacdResult> {
    if fast_period == 0 || slow_period == 0 || signal_period == 0 || fast_period >= slow_period {
        return None;
    }

    let fast = calculate_ema(closes, fast_period);
    let slow = calculate_ema(closes, slow_period);
    if fast.is_empty() || slow.is_empty() {
        return None;
    }

    // Align the two series: fast starts earlier than slow, so only the
    // overlapping tail corresponds to the same closes.
    let offset = slow_period - fast_period;
    if fast.len() <= offset {
        return None;
    }
    let macd_line: Vec<f64> = fast[offset..]
        .iter()
        .zip(slow.iter())
        .map(|(f, s)| f - s)
        .collect();

    if macd_line.len() < signal_period {
        return None;
    }
    let signal_line = calculate_ema(&macd_line, signal_period);
    let signal = *signal_line.last()?;
    let macd = *macd_line.last()?;
    let histogram = macd - signal;

    if macd.is_finite() && signal.is_finite() && histogram.is_finite() {
        Some(MacdResult {
            macd,
            signal,
            histogram,
        })
    } else {
        None
    }
}

/// Standard 12/26/9 MACD.
pub fn calculate(closes: &[f64]) -> Option<MacdResult> {
    calculate_macd(closes, 12, 26, 9)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_insufficient_data() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        assert!(calculate(&closes).is_none());
    }

    #[test]
    fn macd_bad_periods() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 26, 12, 9).is_none());
        assert!(calculate_macd(&closes, 0, 26, 9).is_none());
    }

    #[test]
    fn macd_rising_trend_is_positive() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        let result = calculate(&closes).unwrap();
        assert!(result.macd > 0.0, "rising closes should give positive MACD");
    }

    #[test]
    fn macd_flat_series_converges_to_zero() {
        let closes = vec![100.0; 100];
        let result = calculate(&closes).unwrap();
        assert!(result.macd.abs() < 1e-9);
        assert!(result.histogram.abs() < 1e-9);
    }
}
