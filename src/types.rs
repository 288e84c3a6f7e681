use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use rust_decimal::Decimal;

use crate::error::LedgerError;

pub type AddressId = u64;

/// Per-asset balance: asset id -> {symbol, amount}
pub type Balances = BTreeMap<String, BalanceEntry>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub symbol: String,
    pub amount: Decimal,
}

impl BalanceEntry {
    pub fn zero(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            amount: Decimal::ZERO,
        }
    }
}

/// Persisted address record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub id: AddressId,
    pub address: String,
    pub balance: Balances,
    /// Unix seconds of the transaction that first referenced this address
    pub time: i64,
    /// Bumped on every committed update, checked at commit time
    pub version: u64,
}

impl Address {
    pub fn amount(&self, asset: &str) -> Decimal {
        self.balance
            .get(asset)
            .map(|b| b.amount)
            .unwrap_or(Decimal::ZERO)
    }
}

/// Attributes for an address that does not exist yet
#[derive(Debug, Clone)]
pub struct NewAddress {
    pub address: String,
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub address_id: AddressId,
    pub txid: String,
    pub block_height: u64,
    pub tx_index: u32,
    pub time: i64,
    pub kind: TxKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub address_id: AddressId,
    /// The claim transaction itself
    pub claim_txid: String,
    /// Previously unclaimed transactions consumed by this claim
    pub txids: Vec<String>,
    pub block_index: u64,
}

/// Closed set of transaction types.
///
/// Upstream sends the type as a string ("ContractTransaction", ...); anything
/// outside this set is rejected when the payload is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TxKind {
    #[default]
    #[serde(rename = "ContractTransaction")]
    Contract,
    #[serde(rename = "ClaimTransaction")]
    Claim,
    #[serde(rename = "InvocationTransaction")]
    Invocation,
    #[serde(rename = "MinerTransaction")]
    Miner,
    #[serde(rename = "IssueTransaction")]
    Issue,
    #[serde(rename = "RegisterTransaction")]
    Register,
    #[serde(rename = "EnrollmentTransaction")]
    Enrollment,
    #[serde(rename = "PublishTransaction")]
    Publish,
    #[serde(rename = "StateTransaction")]
    State,
}

impl TxKind {
    /// Human readable label for listings
    pub fn label(&self) -> &'static str {
        match self {
            TxKind::Contract => "Contract",
            TxKind::Claim => "GAS Claim",
            TxKind::Invocation => "Invocation",
            TxKind::Miner => "Miner",
            TxKind::Issue => "Issue",
            TxKind::Register => "Asset Register",
            TxKind::Enrollment => "Enrollment",
            TxKind::Publish => "Contract Publish",
            TxKind::State => "State",
        }
    }
}

impl FromStr for TxKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ContractTransaction" => Ok(TxKind::Contract),
            "ClaimTransaction" => Ok(TxKind::Claim),
            "InvocationTransaction" => Ok(TxKind::Invocation),
            "MinerTransaction" => Ok(TxKind::Miner),
            "IssueTransaction" => Ok(TxKind::Issue),
            "RegisterTransaction" => Ok(TxKind::Register),
            "EnrollmentTransaction" => Ok(TxKind::Enrollment),
            "PublishTransaction" => Ok(TxKind::Publish),
            "StateTransaction" => Ok(TxKind::State),
            other => Err(LedgerError::Payload(format!("unknown transaction type: {}", other))),
        }
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Spent input. Values are decimal strings on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vin {
    pub address_hash: String,
    pub asset: String,
    pub value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vout {
    pub address: String,
    pub asset: String,
    pub value: Decimal,
    #[serde(default)]
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimPayload {
    pub address: String,
    pub txids: Vec<String>,
}

/// Everything the engine needs to apply one transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxPayload {
    pub txid: String,
    pub tx_index: u32,
    pub block_height: u64,
    pub time: i64,
    #[serde(default, rename = "type")]
    pub kind: TxKind,
    #[serde(default)]
    pub vins: Vec<Vin>,
    #[serde(default)]
    pub vouts: Vec<Vout>,
    #[serde(default)]
    pub claim: Option<ClaimPayload>,
}

impl TxPayload {
    /// Reject payloads the engine cannot account for
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.txid.is_empty() {
            return Err(LedgerError::Payload("empty txid".to_string()));
        }
        for vin in &self.vins {
            if vin.address_hash.is_empty() {
                return Err(LedgerError::Payload(format!("input without address in {}", self.txid)));
            }
            if vin.value.is_sign_negative() {
                return Err(LedgerError::Payload(format!(
                    "negative input value {} in {}",
                    vin.value, self.txid
                )));
            }
        }
        for vout in &self.vouts {
            if vout.address.is_empty() {
                return Err(LedgerError::Payload(format!("output without address in {}", self.txid)));
            }
            if vout.value.is_sign_negative() {
                return Err(LedgerError::Payload(format!(
                    "negative output value {} in {}",
                    vout.value, self.txid
                )));
            }
        }
        if let Some(claim) = &self.claim {
            if claim.address.is_empty() {
                return Err(LedgerError::MalformedClaim(format!(
                    "claim in {} has no address",
                    self.txid
                )));
            }
        }
        Ok(())
    }
}

/// Position of a transaction in the chain, ordered by height then index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxCursor {
    pub height: u64,
    pub tx_index: u32,
}

impl TxCursor {
    pub fn of(tx: &TxPayload) -> Self {
        Self { height: tx.block_height, tx_index: tx.tx_index }
    }

    /// height (u64 BE) ‖ tx_index (u32 BE)
    pub fn to_bytes(self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(12);
        bytes.extend_from_slice(&self.height.to_be_bytes());
        bytes.extend_from_slice(&self.tx_index.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 12 {
            return None;
        }
        let height = u64::from_be_bytes(bytes[..8].try_into().ok()?);
        let tx_index = u32::from_be_bytes(bytes[8..].try_into().ok()?);
        Some(Self { height, tx_index })
    }
}

impl fmt::Display for TxCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.height, self.tx_index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockPayload {
    pub height: u64,
    pub time: i64,
    pub transactions: Vec<TxPayload>,
}

/// Pending changes for one address inside one transaction
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AddressAttrs {
    pub balance: Balances,
    pub history: Vec<HistoryEntry>,
    pub claim: Option<Claim>,
    /// Materialized by this transaction, not in the store yet
    pub is_new: bool,
}

/// Transient (address, attrs) pair threaded through the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingUnit {
    pub address: Address,
    pub attrs: AddressAttrs,
}

impl WorkingUnit {
    pub fn existing(address: Address) -> Self {
        let attrs = AddressAttrs {
            balance: address.balance.clone(),
            ..Default::default()
        };
        Self { address, attrs }
    }

    pub fn materialized(address: Address) -> Self {
        let mut unit = Self::existing(address);
        unit.attrs.is_new = true;
        unit
    }

    /// Anything to write for this address?
    pub fn is_dirty(&self) -> bool {
        self.attrs.is_new
            || !self.attrs.history.is_empty()
            || self.attrs.claim.is_some()
            || self.attrs.balance != self.address.balance
    }
}
