use std::{fmt, str::FromStr};

pub use bitcoin::Network as BitcoinNetwork;
use bitcoin::{hashes::Hash, Amount, OutPoint, ScriptBuf, TxOut, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outputs below this value are considered uneconomical and never created.
pub const DUST_LIMIT: Amount = Amount::from_sat(546);
/// Value assigned to the inscription output of the reveal transaction.
pub const POSTAGE_VALUE: Amount = Amount::from_sat(551);
/// Consensus leaf version of tapscript leaves (BIP-342).
pub const TAPROOT_LEAF_VERSION: u8 = 0xc0;

/// An unspent output offered as a funding candidate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    pub value: Amount,
    /// Missing when the UTXO source could not resolve the locking script.
    pub script_pubkey: Option<ScriptBuf>,
    /// The output already carries an inscription.
    pub has_resource: bool,
}

impl Utxo {
    pub fn new(txid: Txid, vout: u32, value: Amount, script_pubkey: ScriptBuf) -> Self {
        Self {
            txid,
            vout,
            value,
            script_pubkey: Some(script_pubkey),
            has_resource: false,
        }
    }

    pub fn with_resource(mut self, has_resource: bool) -> Self {
        self.has_resource = has_resource;
        self
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.txid,
            vout: self.vout,
        }
    }

    pub fn txout(&self) -> Option<TxOut> {
        self.script_pubkey.as_ref().map(|script_pubkey| TxOut {
            value: self.value,
            script_pubkey: script_pubkey.clone(),
        })
    }
}

/// Fee rate, stored with milli-satoshi precision so fee arithmetic stays in integers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeeRate {
    sat_per_kvb: u64,
}

impl FeeRate {
    pub fn from_sat_per_vb(sat_per_vb: f64) -> Result<Self> {
        if !sat_per_vb.is_finite() || sat_per_vb <= 0.0 {
            return Err(InscriberError::InvalidFeeRate(sat_per_vb.to_string()));
        }

        // rounded up so fees never fall below the requested rate; float noise
        // such as 1.1 * 1000 = 1100.0000000000002 is not rounded up
        let scaled = sat_per_vb * 1000.0;
        let nearest = scaled.round();
        let sat_per_kvb = if (scaled - nearest).abs() < 1e-6 {
            nearest
        } else {
            scaled.ceil()
        }
        .max(1.0);
        if sat_per_kvb > u64::MAX as f64 {
            return Err(InscriberError::InvalidFeeRate(sat_per_vb.to_string()));
        }

        Ok(Self {
            sat_per_kvb: sat_per_kvb as u64,
        })
    }

    pub fn from_sat_per_kvb(sat_per_kvb: u64) -> Result<Self> {
        if sat_per_kvb == 0 {
            return Err(InscriberError::InvalidFeeRate("0".to_string()));
        }
        Ok(Self { sat_per_kvb })
    }

    pub fn sat_per_kvb(&self) -> u64 {
        self.sat_per_kvb
    }

    pub fn sat_per_vb(&self) -> f64 {
        self.sat_per_kvb as f64 / 1000.0
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat/vB", self.sat_per_vb())
    }
}

/// Identifier of an existing inscription, `<txid>i<index>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InscriptionId {
    pub txid: Txid,
    pub index: u32,
}

impl InscriptionId {
    /// Encoding used by the parent tag: txid bytes followed by the
    /// little-endian index with trailing zero bytes removed.
    pub fn to_tag_value(&self) -> Vec<u8> {
        let mut value = self.txid.to_byte_array().to_vec();
        let index = self.index.to_le_bytes();
        let significant = index.iter().rposition(|byte| *byte != 0).map_or(0, |i| i + 1);
        value.extend_from_slice(&index[..significant]);
        value
    }

    pub fn from_tag_value(value: &[u8]) -> Result<Self> {
        if value.len() < 32 || value.len() > 36 {
            return Err(InscriberError::InvalidInput(format!(
                "parent tag value has invalid length {}",
                value.len()
            )));
        }

        let txid = Txid::from_slice(&value[..32])
            .map_err(|e| InscriberError::InvalidInput(e.to_string()))?;
        let mut index = [0u8; 4];
        index[..value.len() - 32].copy_from_slice(&value[32..]);

        Ok(Self {
            txid,
            index: u32::from_le_bytes(index),
        })
    }
}

impl fmt::Display for InscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}i{}", self.txid, self.index)
    }
}

impl FromStr for InscriptionId {
    type Err = InscriberError;

    fn from_str(s: &str) -> Result<Self> {
        let (txid, index) = s
            .split_once('i')
            .ok_or_else(|| InscriberError::InvalidInput(format!("invalid inscription id: {s}")))?;
        let txid = Txid::from_str(txid)
            .map_err(|e| InscriberError::InvalidInput(format!("invalid inscription id: {e}")))?;
        let index = index
            .parse::<u32>()
            .map_err(|e| InscriberError::InvalidInput(format!("invalid inscription id: {e}")))?;

        Ok(Self { txid, index })
    }
}

/// Chain state of a broadcast transaction as reported by the broadcaster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Unknown,
    Mempool,
    Confirmed,
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxConfirmation {
    pub status: ChainStatus,
    pub confirmations: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidUtxo,
    InvalidFeeRate,
    InvalidInput,
    InvalidKey,
    InsufficientFunds,
    AllUtxosContainResources,
    NoEligibleUtxos,
    SigningError,
    InvalidTransaction,
    BroadcastFailure,
    UtxoSourceFailure,
    InitializationFailed,
    InvalidStateTransition,
    UnknownTransaction,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidUtxo => "INVALID_UTXO",
            ErrorKind::InvalidFeeRate => "INVALID_FEE_RATE",
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::InvalidKey => "INVALID_KEY",
            ErrorKind::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorKind::AllUtxosContainResources => "ALL_UTXOS_CONTAIN_RESOURCES",
            ErrorKind::NoEligibleUtxos => "NO_ELIGIBLE_UTXOS",
            ErrorKind::SigningError => "SIGNING_ERROR",
            ErrorKind::InvalidTransaction => "INVALID_TRANSACTION",
            ErrorKind::BroadcastFailure => "BROADCAST_FAILURE",
            ErrorKind::UtxoSourceFailure => "UTXO_SOURCE_FAILURE",
            ErrorKind::InitializationFailed => "INITIALIZATION_FAILED",
            ErrorKind::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            ErrorKind::UnknownTransaction => "UNKNOWN_TRANSACTION",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Network,
    Signing,
    Transaction,
    System,
}

#[derive(Debug, Error)]
pub enum InscriberError {
    #[error("Invalid UTXO: {0}")]
    InvalidUtxo(String),

    #[error("Invalid fee rate: {0}")]
    InvalidFeeRate(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Amount, available: Amount },

    #[error("All UTXOs contain resources and resource spending is not allowed")]
    AllUtxosContainResources,

    #[error("No eligible UTXOs")]
    NoEligibleUtxos,

    #[error("Signing error: {0}")]
    SigningError(String),

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Broadcast failure: {0}")]
    BroadcastFailure(String),

    #[error("UTXO source failure: {0}")]
    UtxoSourceFailure(String),

    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Invalid status transition for {id}: {from:?} -> {to:?}")]
    InvalidStateTransition {
        id: String,
        from: crate::tracker::TransactionStatus,
        to: crate::tracker::TransactionStatus,
    },

    #[error("Unknown transaction: {0}")]
    UnknownTransaction(String),
}

impl InscriberError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InscriberError::InvalidUtxo(_) => ErrorKind::InvalidUtxo,
            InscriberError::InvalidFeeRate(_) => ErrorKind::InvalidFeeRate,
            InscriberError::InvalidInput(_) => ErrorKind::InvalidInput,
            InscriberError::InvalidKey(_) => ErrorKind::InvalidKey,
            InscriberError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            InscriberError::AllUtxosContainResources => ErrorKind::AllUtxosContainResources,
            InscriberError::NoEligibleUtxos => ErrorKind::NoEligibleUtxos,
            InscriberError::SigningError(_) => ErrorKind::SigningError,
            InscriberError::InvalidTransaction(_) => ErrorKind::InvalidTransaction,
            InscriberError::BroadcastFailure(_) => ErrorKind::BroadcastFailure,
            InscriberError::UtxoSourceFailure(_) => ErrorKind::UtxoSourceFailure,
            InscriberError::InitializationFailed(_) => ErrorKind::InitializationFailed,
            InscriberError::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            InscriberError::UnknownTransaction(_) => ErrorKind::UnknownTransaction,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self.kind() {
            ErrorKind::InvalidUtxo
            | ErrorKind::InvalidFeeRate
            | ErrorKind::InvalidInput
            | ErrorKind::InvalidKey
            | ErrorKind::InsufficientFunds
            | ErrorKind::AllUtxosContainResources
            | ErrorKind::NoEligibleUtxos => ErrorCategory::Validation,
            ErrorKind::BroadcastFailure | ErrorKind::UtxoSourceFailure => ErrorCategory::Network,
            ErrorKind::SigningError => ErrorCategory::Signing,
            ErrorKind::InvalidTransaction => ErrorCategory::Transaction,
            ErrorKind::InitializationFailed
            | ErrorKind::InvalidStateTransition
            | ErrorKind::UnknownTransaction => ErrorCategory::System,
        }
    }

    /// Signing and extraction failures need fresh inputs before another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network | ErrorCategory::Validation
        )
    }

    pub fn to_structured(&self) -> StructuredError {
        StructuredError {
            code: self.kind(),
            message: self.to_string(),
            category: self.category(),
            timestamp: Utc::now(),
        }
    }
}

/// Error record stored on a tracked transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StructuredError {
    pub code: ErrorKind,
    pub message: String,
    pub category: ErrorCategory,
    pub timestamp: DateTime<Utc>,
}

pub type Result<T> = std::result::Result<T, InscriberError>;

impl From<bitcoin::address::ParseError> for InscriberError {
    fn from(error: bitcoin::address::ParseError) -> Self {
        InscriberError::InvalidInput(error.to_string())
    }
}

impl From<hex::FromHexError> for InscriberError {
    fn from(error: hex::FromHexError) -> Self {
        InscriberError::InvalidKey(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_rate_rejects_non_positive_values() {
        assert!(matches!(
            FeeRate::from_sat_per_vb(0.0),
            Err(InscriberError::InvalidFeeRate(_))
        ));
        assert!(matches!(
            FeeRate::from_sat_per_vb(-3.0),
            Err(InscriberError::InvalidFeeRate(_))
        ));
        assert!(FeeRate::from_sat_per_vb(f64::NAN).is_err());
        assert!(FeeRate::from_sat_per_vb(f64::INFINITY).is_err());
        assert!(FeeRate::from_sat_per_kvb(0).is_err());
    }

    #[test]
    fn fee_rate_keeps_milli_satoshi_precision() {
        let rate = FeeRate::from_sat_per_vb(1.1).unwrap();
        assert_eq!(rate.sat_per_kvb(), 1100);
        assert_eq!(rate.to_string(), "1.1 sat/vB");
    }

    #[test]
    fn fee_rate_rounds_up() {
        let rate = FeeRate::from_sat_per_vb(1.0004).unwrap();
        assert_eq!(rate.sat_per_kvb(), 1001);
        // ceil(1000 vB * 1.0004 sat/vB)
        assert_eq!(
            crate::inscriber::fee::InscriberFeeCalculator::calculate_fee(1000, rate),
            bitcoin::Amount::from_sat(1001)
        );

        let tiny = FeeRate::from_sat_per_vb(0.0004).unwrap();
        assert_eq!(tiny.sat_per_kvb(), 1);
        assert_eq!(
            crate::inscriber::fee::InscriberFeeCalculator::calculate_fee(100, tiny),
            bitcoin::Amount::from_sat(1)
        );
    }

    #[test]
    fn inscription_id_round_trips_through_string_and_tag() {
        let id: InscriptionId =
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33bi256"
                .parse()
                .unwrap();
        assert_eq!(id.index, 256);
        assert_eq!(
            id.to_string(),
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33bi256"
        );

        let tag = id.to_tag_value();
        // 256 little-endian is [0x00, 0x01], trailing zeros trimmed
        assert_eq!(tag.len(), 34);
        assert_eq!(&tag[32..], &[0x00, 0x01]);
        assert_eq!(InscriptionId::from_tag_value(&tag).unwrap(), id);
    }

    #[test]
    fn inscription_id_with_zero_index_has_bare_txid_tag() {
        let id: InscriptionId =
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33bi0"
                .parse()
                .unwrap();
        assert_eq!(id.to_tag_value().len(), 32);
    }

    #[test]
    fn error_categories_drive_retryability() {
        let err = InscriberError::BroadcastFailure("rejected".into());
        assert_eq!(err.category(), ErrorCategory::Network);
        assert!(err.is_retryable());

        let err = InscriberError::SigningError("bad key".into());
        assert!(!err.is_retryable());

        let err = InscriberError::InvalidTransaction("not finalized".into());
        assert_eq!(err.kind().code(), "INVALID_TRANSACTION");
        assert!(!err.is_retryable());

        let structured = InscriberError::NoEligibleUtxos.to_structured();
        assert_eq!(structured.code, ErrorKind::NoEligibleUtxos);
        assert_eq!(structured.category, ErrorCategory::Validation);
    }
}
