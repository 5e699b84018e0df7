use super::Pubkey;
use borsh::{BorshDeserialize, BorshSerialize};

pub const MAX_POSITIONS: usize = 5;

/// Per-user root record. `positions` points at the user's positions record.
#[derive(Debug, Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct UserAccount {
    pub authority: Pubkey,
    pub collateral: u128,
    pub cumulative_deposits: i128,
    pub total_fee_paid: u128,
    pub total_token_discount: u128,
    pub total_referral_reward: u128,
    pub total_referee_discount: u128,
    pub positions: Pubkey,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct UserPositionsAccount {
    pub user: Pubkey,
    pub positions: [MarketPosition; MAX_POSITIONS],
}

impl UserPositionsAccount {
    /// Positions with a non-zero base amount.
    pub fn open_positions(&self) -> impl Iterator<Item = &MarketPosition> {
        self.positions.iter().filter(|position| position.base_asset_amount != 0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct MarketPosition {
    pub market_index: u64,
    pub base_asset_amount: i128,
    pub quote_asset_amount: u128,
    pub last_cumulative_funding_rate: i128,
    pub last_cumulative_repeg_rebate: u128,
    pub last_funding_rate_ts: i64,
    pub open_orders: u128,
}
