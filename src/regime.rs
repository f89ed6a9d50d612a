// =============================================================================
// Regime Detection — five-way classifier + three-way collapsing wrapper
// =============================================================================
//
// Market regime classification using multiple quantitative indicators (ADX,
// Bollinger Band Width, Hurst exponent, Shannon entropy) lives in the kept
// submodules below. The underlying detector classifies into five regimes
// (Trending/Ranging/Volatile/Squeeze/Dead); the Signal Engine only needs the
// literal three-way `Regime` named in the data model. Squeeze collapses to
// Ranging (a tight-range pre-breakout state is still non-trending for sizing
// purposes); Dead also collapses to Ranging for the snapshot's `regime` field
// but remains a hard Tradeability kill for V4 (see SPEC_FULL.md §11).

pub mod detector;
pub mod entropy;
pub mod hurst;

pub use detector::{MarketRegime, RegimeDetector, RegimeState};
pub use entropy::ShannonEntropyFilter;
pub use hurst::calculate_hurst_exponent;

use crate::market_data::Candle;
use crate::types::{Regime, RegimeSnapshot};

pub fn collapse(market_regime: MarketRegime) -> Regime {
    match market_regime {
        MarketRegime::Trending => Regime::Trending,
        MarketRegime::Volatile => Regime::Volatile,
        MarketRegime::Ranging | MarketRegime::Squeeze | MarketRegime::Dead => Regime::Ranging,
    }
}

/// True when the full five-way classification reached `Dead` — a hard V4
/// Tradeability kill distinct from an ordinary Ranging classification.
pub fn is_dead(state: &RegimeState) -> bool {
    state.regime == MarketRegime::Dead
}

/// Run the detector and project its five-way state down to the spec's
/// literal three-way `RegimeSnapshot`.
pub fn evaluate_regime(detector: &RegimeDetector, candles: &[Candle]) -> Option<RegimeSnapshot> {
    let state = detector.update(candles)?;
    Some(RegimeSnapshot {
        regime: collapse(state.regime),
        confidence: state.confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn squeeze_and_dead_collapse_to_ranging() {
        assert_eq!(collapse(MarketRegime::Squeeze), Regime::Ranging);
        assert_eq!(collapse(MarketRegime::Dead), Regime::Ranging);
        assert_eq!(collapse(MarketRegime::Ranging), Regime::Ranging);
    }

    #[test]
    fn trending_and_volatile_pass_through() {
        assert_eq!(collapse(MarketRegime::Trending), Regime::Trending);
        assert_eq!(collapse(MarketRegime::Volatile), Regime::Volatile);
    }
}
