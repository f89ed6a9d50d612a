// =============================================================================
// Correlation Guard — V4 symbol -> cluster map
// =============================================================================
//
// A static table grouping correlated symbols so the V4 Paper Trader's
// anti-correlation admission check (spec §4.8 step 4) can reject a fourth
// same-direction position within one cluster even though each symbol is
// individually under its own per-symbol dedupe limit. New to this crate;
// the teacher has no correlation concept, so the shape here is a minimal
// `HashMap<Symbol, &'static str>` rather than anything grounded on teacher
// code.

use std::collections::HashMap;

use crate::types::Symbol;

fn cluster_table() -> &'static [(&'static str, &'static str)] {
    &[
        ("BTCUSDT", "majors"),
        ("ETHUSDT", "majors"),
        ("BNBUSDT", "majors"),
        ("SOLUSDT", "l1_alt"),
        ("AVAXUSDT", "l1_alt"),
        ("ADAUSDT", "l1_alt"),
        ("DOTUSDT", "l1_alt"),
        ("DOGEUSDT", "meme"),
        ("SHIBUSDT", "meme"),
        ("PEPEUSDT", "meme"),
        ("XRPUSDT", "payments"),
        ("LTCUSDT", "payments"),
    ]
}

/// Lazily-built lookup from symbol to cluster name; unknown symbols get
/// their own singleton cluster (their symbol name) so they never collide
/// with anything else.
pub struct ClusterMap {
    table: HashMap<&'static str, &'static str>,
}

impl ClusterMap {
    pub fn new() -> Self {
        Self { table: cluster_table().iter().copied().collect() }
    }

    /// The cluster a symbol belongs to, or a synthetic cluster named after
    /// the symbol itself when it isn't in the static table.
    pub fn cluster_of<'a>(&'a self, symbol: &'a Symbol) -> &'a str {
        self.table.get(symbol.as_str()).copied().unwrap_or(symbol.as_str())
    }

    /// Count of open positions whose symbol shares `symbol`'s cluster and
    /// whose direction matches `direction_filter`.
    pub fn same_cluster_count<'a>(
        &self,
        symbol: &Symbol,
        positions: impl Iterator<Item = &'a Symbol>,
    ) -> usize {
        let target = self.cluster_of(symbol);
        positions.filter(|s| self.cluster_of(s) == target).count()
    }
}

impl Default for ClusterMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_symbols_share_a_cluster() {
        let map = ClusterMap::new();
        assert_eq!(map.cluster_of(&"BTCUSDT".to_string()), map.cluster_of(&"ETHUSDT".to_string()));
        assert_ne!(map.cluster_of(&"BTCUSDT".to_string()), map.cluster_of(&"DOGEUSDT".to_string()));
    }

    #[test]
    fn unknown_symbol_is_its_own_cluster() {
        let map = ClusterMap::new();
        assert_eq!(map.cluster_of(&"ZZZUSDT".to_string()), "ZZZUSDT");
    }

    #[test]
    fn same_cluster_count_filters_correctly() {
        let map = ClusterMap::new();
        let open: Vec<String> = vec!["ETHUSDT".into(), "SOLUSDT".into(), "BNBUSDT".into()];
        let count = map.same_cluster_count(&"BTCUSDT".to_string(), open.iter());
        assert_eq!(count, 2); // ETHUSDT + BNBUSDT share "majors"
    }
}
