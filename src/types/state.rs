use super::Pubkey;
use borsh::{BorshDeserialize, BorshSerialize};

/// Protocol-global configuration record.
///
/// Besides risk parameters it holds the addresses of every other
/// protocol-global record, so it must be read before those can be subscribed.
#[derive(Debug, Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct StateAccount {
    pub admin: Pubkey,
    pub exchange_paused: bool,
    pub funding_paused: bool,
    pub admin_controls_prices: bool,
    pub collateral_mint: Pubkey,
    pub collateral_vault: Pubkey,
    pub insurance_vault: Pubkey,
    pub markets: Pubkey,
    pub trade_history: Pubkey,
    pub deposit_history: Pubkey,
    pub funding_payment_history: Pubkey,
    pub funding_rate_history: Pubkey,
    pub liquidation_history: Pubkey,
    pub curve_history: Pubkey,
    pub margin_ratio_initial: u128,
    pub margin_ratio_partial: u128,
    pub margin_ratio_maintenance: u128,
    pub fee_structure: FeeStructure,
    pub collateral_deposits: u128,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct FeeStructure {
    pub fee_numerator: u128,
    pub fee_denominator: u128,
}
