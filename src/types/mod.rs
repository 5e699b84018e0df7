pub mod history;
pub mod market;
pub mod pubkey;
pub mod state;
pub mod user;

pub use history::{
    CurveHistoryAccount, CurveRecord, DepositDirection, DepositHistoryAccount, DepositRecord, FundingPaymentHistoryAccount,
    FundingPaymentRecord, FundingRateHistoryAccount, FundingRateRecord, LiquidationHistoryAccount, LiquidationRecord,
    PositionDirection, TradeHistoryAccount, TradeRecord,
};
pub use market::{Amm, MAX_MARKETS, Market, MarketsAccount, OracleSource};
pub use pubkey::{ParsePubkeyError, Pubkey};
pub use state::{FeeStructure, StateAccount};
pub use user::{MAX_POSITIONS, MarketPosition, UserAccount, UserPositionsAccount};

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

/// Every record type this crate knows how to decode and subscribe to.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash, EnumString, EnumIter, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum AccountKind {
    State,
    Markets,
    TradeHistory,
    DepositHistory,
    FundingPaymentHistory,
    FundingRateHistory,
    CurveHistory,
    LiquidationHistory,
    User,
    UserPositions,
}

impl AccountKind {
    /// Account name as declared by the on-chain program, used for the discriminator.
    pub fn account_name(&self) -> &'static str {
        match self {
            AccountKind::State => "State",
            AccountKind::Markets => "Markets",
            AccountKind::TradeHistory => "TradeHistory",
            AccountKind::DepositHistory => "DepositHistory",
            AccountKind::FundingPaymentHistory => "FundingPaymentHistory",
            AccountKind::FundingRateHistory => "FundingRateHistory",
            AccountKind::CurveHistory => "CurveHistory",
            AccountKind::LiquidationHistory => "LiquidationHistory",
            AccountKind::User => "User",
            AccountKind::UserPositions => "UserPositions",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_account_kind_names() {
        assert_eq!(AccountKind::FundingRateHistory.to_string(), "fundingRateHistory");
        assert_eq!(AccountKind::from_str("userPositions").unwrap(), AccountKind::UserPositions);
        assert_eq!(AccountKind::iter().count(), 10);
    }
}
