use super::Pubkey;
use borsh::{BorshDeserialize, BorshSerialize};

pub const MAX_MARKETS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct MarketsAccount {
    pub markets: [Market; MAX_MARKETS],
}

impl Default for MarketsAccount {
    fn default() -> Self {
        Self { markets: [Market::default(); MAX_MARKETS] }
    }
}

impl MarketsAccount {
    pub fn get_market(&self, market_index: u64) -> Option<&Market> {
        usize::try_from(market_index).ok().and_then(|idx| self.markets.get(idx))
    }

    pub fn initialized_markets(&self) -> impl Iterator<Item = (usize, &Market)> {
        self.markets.iter().enumerate().filter(|(_, market)| market.initialized)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Market {
    pub initialized: bool,
    pub base_asset_amount_long: i128,
    pub base_asset_amount_short: i128,
    pub base_asset_amount: i128,
    pub open_interest: u128,
    pub amm: Amm,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Amm {
    pub oracle: Pubkey,
    pub oracle_source: OracleSource,
    pub base_asset_reserve: u128,
    pub quote_asset_reserve: u128,
    pub cumulative_funding_rate_long: i128,
    pub cumulative_funding_rate_short: i128,
    pub last_funding_rate: i128,
    pub last_funding_rate_ts: i64,
    pub funding_period: i64,
    pub last_oracle_price_twap: i128,
    pub last_mark_price_twap: u128,
    pub last_mark_price_twap_ts: i64,
    pub sqrt_k: u128,
    pub peg_multiplier: u128,
    pub total_fee: u128,
    pub total_fee_minus_distributions: u128,
    pub minimum_base_asset_trade_size: u128,
    pub minimum_quote_asset_trade_size: u128,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum OracleSource {
    #[default]
    Pyth,
    Switchboard,
}
