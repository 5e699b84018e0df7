//! Decoding of raw account bytes into typed records.
//!
//! The transport layers only ever see opaque bytes; subscribers turn them into
//! snapshots through an [`AccountCoder`] supplied by the caller.

use crate::types::{
    AccountKind, CurveHistoryAccount, DepositHistoryAccount, FundingPaymentHistoryAccount, FundingRateHistoryAccount,
    LiquidationHistoryAccount, MarketsAccount, StateAccount, TradeHistoryAccount, UserAccount, UserPositionsAccount,
};
use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const DISCRIMINATOR_SIZE: usize = 8;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("{kind} account data too short: {len} bytes")]
    TooShort { kind: AccountKind, len: usize },
    #[error("{kind} account discriminator mismatch")]
    DiscriminatorMismatch { kind: AccountKind },
    #[error("failed to deserialize {kind} account: {source}")]
    Borsh {
        kind: AccountKind,
        #[source]
        source: std::io::Error,
    },
    #[error("coder returned {actual} while decoding {expected}")]
    UnexpectedKind { expected: AccountKind, actual: AccountKind },
}

/// Decodes raw bytes of a known record kind.
pub trait AccountCoder: Send + Sync {
    fn decode(&self, kind: AccountKind, data: &[u8]) -> Result<DecodedAccount, DecodeError>;
}

/// A record decoded by an [`AccountCoder`].
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedAccount {
    State(StateAccount),
    Markets(Box<MarketsAccount>),
    TradeHistory(TradeHistoryAccount),
    DepositHistory(DepositHistoryAccount),
    FundingPaymentHistory(FundingPaymentHistoryAccount),
    FundingRateHistory(FundingRateHistoryAccount),
    CurveHistory(CurveHistoryAccount),
    LiquidationHistory(LiquidationHistoryAccount),
    User(UserAccount),
    UserPositions(UserPositionsAccount),
}

impl DecodedAccount {
    pub fn kind(&self) -> AccountKind {
        match self {
            DecodedAccount::State(_) => AccountKind::State,
            DecodedAccount::Markets(_) => AccountKind::Markets,
            DecodedAccount::TradeHistory(_) => AccountKind::TradeHistory,
            DecodedAccount::DepositHistory(_) => AccountKind::DepositHistory,
            DecodedAccount::FundingPaymentHistory(_) => AccountKind::FundingPaymentHistory,
            DecodedAccount::FundingRateHistory(_) => AccountKind::FundingRateHistory,
            DecodedAccount::CurveHistory(_) => AccountKind::CurveHistory,
            DecodedAccount::LiquidationHistory(_) => AccountKind::LiquidationHistory,
            DecodedAccount::User(_) => AccountKind::User,
            DecodedAccount::UserPositions(_) => AccountKind::UserPositions,
        }
    }
}

/// A typed record that can be subscribed to.
pub trait ProgramAccount: BorshSerialize + BorshDeserialize + Send + Sync + 'static {
    const KIND: AccountKind;

    fn from_decoded(decoded: DecodedAccount) -> Option<Self>;

    fn into_decoded(self) -> DecodedAccount;
}

macro_rules! program_account {
    ($ty:ty, $variant:ident) => {
        impl ProgramAccount for $ty {
            const KIND: AccountKind = AccountKind::$variant;

            fn from_decoded(decoded: DecodedAccount) -> Option<Self> {
                match decoded {
                    DecodedAccount::$variant(account) => Some(account),
                    _ => None,
                }
            }

            fn into_decoded(self) -> DecodedAccount {
                DecodedAccount::$variant(self)
            }
        }
    };
}

program_account!(StateAccount, State);
program_account!(TradeHistoryAccount, TradeHistory);
program_account!(DepositHistoryAccount, DepositHistory);
program_account!(FundingPaymentHistoryAccount, FundingPaymentHistory);
program_account!(FundingRateHistoryAccount, FundingRateHistory);
program_account!(CurveHistoryAccount, CurveHistory);
program_account!(LiquidationHistoryAccount, LiquidationHistory);
program_account!(UserAccount, User);
program_account!(UserPositionsAccount, UserPositions);

// boxed in the enum to keep it small
impl ProgramAccount for MarketsAccount {
    const KIND: AccountKind = AccountKind::Markets;

    fn from_decoded(decoded: DecodedAccount) -> Option<Self> {
        match decoded {
            DecodedAccount::Markets(account) => Some(*account),
            _ => None,
        }
    }

    fn into_decoded(self) -> DecodedAccount {
        DecodedAccount::Markets(Box::new(self))
    }
}

/// Decode `data` as `T` through a type-erased coder.
pub fn decode_account<T: ProgramAccount>(coder: &dyn AccountCoder, data: &[u8]) -> Result<T, DecodeError> {
    let decoded = coder.decode(T::KIND, data)?;
    let actual = decoded.kind();
    T::from_decoded(decoded).ok_or(DecodeError::UnexpectedKind { expected: T::KIND, actual })
}

/// Coder for Anchor style accounts: an 8 byte discriminator followed by borsh.
///
/// Trailing bytes after the record are ignored since accounts are usually
/// allocated larger than their current content.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnchorAccountCoder;

impl AnchorAccountCoder {
    pub fn discriminator(kind: AccountKind) -> [u8; DISCRIMINATOR_SIZE] {
        let hash = Sha256::digest(format!("account:{}", kind.account_name()).as_bytes());
        let mut discriminator = [0u8; DISCRIMINATOR_SIZE];
        discriminator.copy_from_slice(&hash[..DISCRIMINATOR_SIZE]);
        discriminator
    }

    pub fn encode<T: ProgramAccount>(account: &T) -> Vec<u8> {
        let mut data = Self::discriminator(T::KIND).to_vec();
        // writing into a Vec cannot fail
        let _ = account.serialize(&mut data);
        data
    }

    fn deserialize<T: ProgramAccount>(kind: AccountKind, mut body: &[u8]) -> Result<DecodedAccount, DecodeError> {
        T::deserialize(&mut body).map(ProgramAccount::into_decoded).map_err(|source| DecodeError::Borsh { kind, source })
    }
}

impl AccountCoder for AnchorAccountCoder {
    fn decode(&self, kind: AccountKind, data: &[u8]) -> Result<DecodedAccount, DecodeError> {
        if data.len() < DISCRIMINATOR_SIZE {
            return Err(DecodeError::TooShort { kind, len: data.len() });
        }
        let (discriminator, body) = data.split_at(DISCRIMINATOR_SIZE);
        if discriminator != Self::discriminator(kind) {
            return Err(DecodeError::DiscriminatorMismatch { kind });
        }

        match kind {
            AccountKind::State => Self::deserialize::<StateAccount>(kind, body),
            AccountKind::Markets => Self::deserialize::<MarketsAccount>(kind, body),
            AccountKind::TradeHistory => Self::deserialize::<TradeHistoryAccount>(kind, body),
            AccountKind::DepositHistory => Self::deserialize::<DepositHistoryAccount>(kind, body),
            AccountKind::FundingPaymentHistory => Self::deserialize::<FundingPaymentHistoryAccount>(kind, body),
            AccountKind::FundingRateHistory => Self::deserialize::<FundingRateHistoryAccount>(kind, body),
            AccountKind::CurveHistory => Self::deserialize::<CurveHistoryAccount>(kind, body),
            AccountKind::LiquidationHistory => Self::deserialize::<LiquidationHistoryAccount>(kind, body),
            AccountKind::User => Self::deserialize::<UserAccount>(kind, body),
            AccountKind::UserPositions => Self::deserialize::<UserPositionsAccount>(kind, body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Pubkey;

    #[test]
    fn test_decode_user_account() {
        let user = UserAccount { authority: Pubkey::repeat_byte(1), collateral: 1_000, positions: Pubkey::repeat_byte(2), ..Default::default() };
        let mut data = AnchorAccountCoder::encode(&user);
        // padding at the end of the allocation
        data.extend_from_slice(&[0u8; 16]);

        let decoded: UserAccount = decode_account(&AnchorAccountCoder, &data).unwrap();
        assert_eq!(decoded, user);
    }

    #[test]
    fn test_decode_rejects_other_discriminator() {
        let data = AnchorAccountCoder::encode(&UserAccount::default());
        let err = decode_account::<StateAccount>(&AnchorAccountCoder, &data).unwrap_err();
        assert!(matches!(err, DecodeError::DiscriminatorMismatch { kind: AccountKind::State }));
    }

    #[test]
    fn test_decode_rejects_short_and_truncated_data() {
        assert!(matches!(AnchorAccountCoder.decode(AccountKind::User, &[1, 2, 3]), Err(DecodeError::TooShort { len: 3, .. })));

        let mut data = AnchorAccountCoder::encode(&UserAccount::default());
        data.truncate(20);
        assert!(matches!(AnchorAccountCoder.decode(AccountKind::User, &data), Err(DecodeError::Borsh { .. })));
    }

    #[test]
    fn test_markets_account_roundtrip() {
        let mut markets = MarketsAccount::default();
        markets.markets[3].initialized = true;
        markets.markets[3].amm.peg_multiplier = 1_000;

        let decoded: MarketsAccount = decode_account(&AnchorAccountCoder, &AnchorAccountCoder::encode(&markets)).unwrap();
        assert_eq!(decoded.initialized_markets().map(|(idx, _)| idx).collect::<Vec<_>>(), vec![3]);
        assert_eq!(decoded.get_market(3).unwrap().amm.peg_multiplier, 1_000);
    }
}
