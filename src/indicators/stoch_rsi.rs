// =============================================================================
// Stochastic RSI
// =============================================================================
//
// Applies the Stochastic oscillator formula to RSI values rather than to
// price, producing a more sensitive (and noisier) momentum read:
//
//   StochRSI = (RSI - min(RSI, lookback)) / (max(RSI, lookback) - min(RSI, lookback))
//
// %K is a smoothed (SMA) StochRSI; %D is a smoothed %K. Output is in [0, 1].

use super::rsi::calculate_rsi;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StochRsiResult {
    pub k: f64,
    pub d: f64,
}

/// Compute the most recent %K/%D StochRSI pair.
///
/// Returns `None` when there isn't enough RSI history for the stochastic
/// lookback plus the %K/%D smoothing windows, or the RSI range is degenerate
/// (flat RSI => undefined stochastic, conventionally reported as `None`).
pub fn calculate_stoch_rsi(
    closes: &[f64],
    rsi_period: usize,
    stoch_period: usize,
    k_smooth: usize,
    d_smooth: usize,
) -> Option<StochRsiResult> {
    if stoch_period == 0 || k_smooth == 0 || d_smooth == 0 {
        return None;
    }

    let rsi_series = calculate_rsi(closes, rsi_period);
    if rsi_series.len() < stoch_period + k_smooth + d_smooth {
        return None;
    }

    let mut raw_k = Vec::with_capacity(rsi_series.len() - stoch_period + 1);
    for window in rsi_series.windows(stoch_period) {
        let min = window.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = window.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let range = max - min;
        let value = if range == 0.0 {
            0.5 // flat RSI window: neither overbought nor oversold
        } else {
            (window.last().unwrap() - min) / range
        };
        raw_k.push(value);
    }

    if raw_k.len() < k_smooth + d_smooth {
        return None;
    }

    let k_series = sma_series(&raw_k, k_smooth);
    if k_series.len() < d_smooth {
        return None;
    }
    let d_series = sma_series(&k_series, d_smooth);

    let k = *k_series.last()?;
    let d = *d_series.last()?;
    if k.is_finite() && d.is_finite() {
        Some(StochRsiResult { k, d })
    } else {
        None
    }
}

/// Standard 14/14/3/3 StochRSI.
pub fn calculate(closes: &[f64]) -> Option<StochRsiResult> {
    calculate_stoch_rsi(closes, 14, 14, 3, 3)
}

fn sma_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    values
        .windows(period)
        .map(|w| w.iter().sum::<f64>() / period as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stoch_rsi_insufficient_data() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        assert!(calculate(&closes).is_none());
    }

    #[test]
    fn stoch_rsi_range_check() {
        let closes: Vec<f64> = (0..200)
            .map(|i| 100.0 + (i as f64 * 0.2).sin() * 5.0)
            .collect();
        let result = calculate(&closes);
        if let Some(r) = result {
            assert!((0.0..=1.0).contains(&r.k), "k out of range: {}", r.k);
            assert!((0.0..=1.0).contains(&r.d), "d out of range: {}", r.d);
        }
    }

    #[test]
    fn stoch_rsi_flat_series_is_midline() {
        let closes = vec![100.0; 100];
        let result = calculate(&closes).unwrap();
        assert!((result.k - 0.5).abs() < 1e-9);
        assert!((result.d - 0.5).abs() < 1e-9);
    }

    #[test]
    fn stoch_rsi_rising_trend_near_one() {
        let closes: Vec<f64> = (1..=200).map(|x| x as f64).collect();
        let result = calculate(&closes).unwrap();
        assert!(result.k > 0.9, "expected near-overbought k, got {}", result.k);
    }
}
