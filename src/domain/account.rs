//! Account-state snapshot types and the asset identity registry used to
//! resolve spot balances to canonical symbols for valuation.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    Spot,
    Perp,
}

/// A single open position. `size` is always stored as an absolute quantity;
/// direction for perps is implied by the venue rather than tracked here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub coin: String,
    pub market_type: MarketType,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
}

impl Position {
    /// Absolute notional value of the position, ignoring direction.
    pub fn notional(&self) -> Decimal {
        self.size * self.current_price
    }
}

/// Snapshot of the venue account at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub portfolio_value: Decimal,
    pub available_balance: Decimal,
    pub account_value: Decimal,
    pub total_initial_margin: Decimal,
    pub positions: Vec<Position>,
    pub spot_balances: HashMap<String, Decimal>,
    pub timestamp: i64,
    pub is_stale: bool,
}

impl AccountState {
    /// Sum of negative `unrealized_pnl` across all positions, as a fraction
    /// of portfolio value. Used by the liquidation-proximity tripwire.
    pub fn negative_pnl_fraction(&self) -> Decimal {
        if self.portfolio_value.is_zero() {
            return Decimal::ZERO;
        }
        let negative_sum: Decimal = self
            .positions
            .iter()
            .map(|p| p.unrealized_pnl)
            .filter(|pnl| *pnl < Decimal::ZERO)
            .sum();
        (-negative_sum) / self.portfolio_value
    }

    /// Total absolute notional across all open positions.
    pub fn gross_notional(&self) -> Decimal {
        self.positions.iter().map(Position::notional).sum()
    }
}

/// Resolves an asset symbol to its canonical identity: wallet alias (spot
/// balance key), perp-market alias, spot-market alias and default quote
/// currency. Hydrated from static config plus venue metadata at startup.
///
/// Grounded on the original agent's asset identity / market registry
/// modules: resolution is a table lookup with a default-quote fallback,
/// never a heuristic.
#[derive(Debug, Clone, Default)]
pub struct AssetIdentityRegistry {
    canonical: HashMap<String, AssetIdentity>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetIdentity {
    pub canonical_symbol: String,
    pub wallet_alias: String,
    pub perp_alias: String,
    pub spot_alias: String,
    pub default_quote: String,
}

impl AssetIdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or overwrite) the identity for a canonical symbol.
    pub fn register(&mut self, identity: AssetIdentity) {
        self.canonical.insert(identity.canonical_symbol.clone(), identity);
    }

    /// Resolve any known alias (wallet, perp, spot, or the canonical symbol
    /// itself) back to the canonical identity.
    pub fn resolve(&self, alias: &str) -> Option<&AssetIdentity> {
        if let Some(identity) = self.canonical.get(alias) {
            return Some(identity);
        }
        self.canonical.values().find(|identity| {
            identity.wallet_alias == alias || identity.perp_alias == alias || identity.spot_alias == alias
        })
    }

    /// USDC is always worth 1.0; the registry never needs a price lookup
    /// for it. Other assets resolve through their default quote.
    pub fn default_quote_for(&self, alias: &str) -> String {
        if alias.eq_ignore_ascii_case("usdc") {
            return "USDC".to_string();
        }
        self.resolve(alias)
            .map(|identity| identity.default_quote.clone())
            .unwrap_or_else(|| "USDC".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_position(pnl: Decimal) -> Position {
        Position {
            coin: "BTC".into(),
            market_type: MarketType::Perp,
            size: dec!(0.2),
            entry_price: dec!(50000),
            current_price: dec!(45000),
            unrealized_pnl: pnl,
        }
    }

    #[test]
    fn negative_pnl_fraction_ignores_winning_positions() {
        let state = AccountState {
            portfolio_value: dec!(10000),
            available_balance: dec!(5000),
            account_value: dec!(10000),
            total_initial_margin: dec!(2000),
            positions: vec![sample_position(dec!(-1000)), sample_position(dec!(500))],
            spot_balances: HashMap::new(),
            timestamp: 0,
            is_stale: false,
        };
        assert_eq!(state.negative_pnl_fraction(), dec!(0.1));
    }

    #[test]
    fn registry_resolves_by_any_alias() {
        let mut registry = AssetIdentityRegistry::new();
        registry.register(AssetIdentity {
            canonical_symbol: "BTC".into(),
            wallet_alias: "UBTC".into(),
            perp_alias: "BTC-PERP".into(),
            spot_alias: "BTC/USDC".into(),
            default_quote: "USDC".into(),
        });
        assert_eq!(registry.resolve("BTC-PERP").unwrap().canonical_symbol, "BTC");
        assert_eq!(registry.resolve("UBTC").unwrap().canonical_symbol, "BTC");
        assert!(registry.resolve("ETH").is_none());
        assert_eq!(registry.default_quote_for("USDC"), "USDC");
    }
}
