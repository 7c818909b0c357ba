//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode in the store)
//! - Exact integer amounts (no floating point anywhere)
//! - Hex strings for keys, hashes and signatures, as exchanged with peers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Account record
///
/// Numeric fields only ever change by signed diff (see
/// [`crate::account::Change`]); strings and booleans are replaced whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Base58 address, immutable
    pub address: String,
    /// Hex public key, immutable once set
    pub public_key: Option<String>,
    /// Hex second-factor public key, immutable once set
    pub second_public_key: Option<String>,
    /// Delegate name, immutable once set
    pub username: Option<String>,
    /// Unconfirmed delegate name
    pub u_username: Option<String>,
    /// Registered delegate
    pub is_delegate: bool,
    /// Unconfirmed delegate registration
    pub u_is_delegate: bool,
    /// Second signature registered
    pub second_signature: bool,
    /// Unconfirmed second signature
    pub u_second_signature: bool,
    /// Name taken
    pub name_exist: bool,
    /// Unconfirmed name taken
    pub u_name_exist: bool,
    /// Confirmed balance
    pub balance: i64,
    /// Unconfirmed balance
    pub u_balance: i64,
    /// Accumulated vote weight
    pub vote: i64,
    /// Delegate rank
    pub rate: i64,
    /// Delegates voted for (confirmed)
    pub delegates: Vec<String>,
    /// Delegates voted for (unconfirmed)
    pub u_delegates: Vec<String>,
    /// Multisignature group members (confirmed)
    pub multisignatures: Vec<String>,
    /// Multisignature group members (unconfirmed)
    pub u_multisignatures: Vec<String>,
    /// Required multisignature signers
    pub multimin: i64,
    /// Unconfirmed required signers
    pub u_multimin: i64,
    /// Multisignature lifetime in hours
    pub multilifetime: i64,
    /// Unconfirmed lifetime
    pub u_multilifetime: i64,
    /// Last block that touched the account
    pub block_id: Option<String>,
    /// Blocks forged
    pub produced_blocks: i64,
    /// Slots missed
    pub missed_blocks: i64,
    /// Fees earned forging
    pub fees: i64,
    /// Rewards earned forging
    pub rewards: i64,
    /// Never debited
    pub virgin: bool,
}

impl Account {
    /// Fresh account with every counter at zero
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            public_key: None,
            second_public_key: None,
            username: None,
            u_username: None,
            is_delegate: false,
            u_is_delegate: false,
            second_signature: false,
            u_second_signature: false,
            name_exist: false,
            u_name_exist: false,
            balance: 0,
            u_balance: 0,
            vote: 0,
            rate: 0,
            delegates: Vec::new(),
            u_delegates: Vec::new(),
            multisignatures: Vec::new(),
            u_multisignatures: Vec::new(),
            multimin: 0,
            u_multimin: 0,
            multilifetime: 0,
            u_multilifetime: 0,
            block_id: None,
            produced_blocks: 0,
            missed_blocks: 0,
            fees: 0,
            rewards: 0,
            virgin: true,
        }
    }
}

/// Balance-weighted change attributed to a delegate within a round
///
/// Append-only: entries are inserted by merges and deleted a whole round at a
/// time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundLedgerEntry {
    /// Account whose balance or votes changed
    pub address: String,
    /// Signed weight change
    pub amount: i64,
    /// Delegate the weight is attributed to
    pub delegate: String,
    /// Block that caused the change
    pub block_id: Option<String>,
    /// Round the change belongs to
    pub round: Option<u64>,
}

/// Transaction type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum TransactionType {
    /// Balance transfer
    Send = 0,
    /// Second signature registration
    Signature = 1,
    /// Delegate registration
    Delegate = 2,
    /// Delegate votes
    Vote = 3,
    /// Multisignature registration (aggregate type)
    Multi = 4,
    /// Dapp registration
    Dapp = 5,
    /// Transfer into a dapp
    InTransfer = 6,
    /// Transfer out of a dapp
    OutTransfer = 7,
}

impl TryFrom<u8> for TransactionType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => TransactionType::Send,
            1 => TransactionType::Signature,
            2 => TransactionType::Delegate,
            3 => TransactionType::Vote,
            4 => TransactionType::Multi,
            5 => TransactionType::Dapp,
            6 => TransactionType::InTransfer,
            7 => TransactionType::OutTransfer,
            other => return Err(format!("Unknown transaction type: {}", other)),
        })
    }
}

impl From<TransactionType> for u8 {
    fn from(value: TransactionType) -> Self {
        value as u8
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// Transaction as carried in a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Hex SHA-256 of the canonical bytes
    pub id: String,
    /// Transaction type
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    /// Amount moved
    pub amount: u64,
    /// Fee paid
    pub fee: u64,
    /// Epoch seconds
    pub timestamp: u32,
    /// Hex public key of the sender
    pub sender_public_key: String,
    /// Recipient address
    pub recipient_id: Option<String>,
    /// Type-specific payload, already in canonical byte form
    #[serde(default)]
    pub asset: Vec<u8>,
    /// Hex ed25519 signature
    pub signature: Option<String>,
    /// Hex second signature
    pub sign_signature: Option<String>,
}

/// Block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Hex SHA-256 of the full byte layout
    pub id: Option<String>,
    /// Block format version
    pub version: u32,
    /// Epoch seconds
    pub timestamp: u32,
    /// Height (genesis is 1)
    pub height: u64,
    /// Id of the parent block
    pub previous_block: Option<String>,
    /// Number of included transactions
    pub number_of_transactions: u32,
    /// Sum of transaction amounts
    pub total_amount: u64,
    /// Sum of transaction fees
    pub total_fee: u64,
    /// Forging reward
    pub reward: u64,
    /// Sum of transaction byte lengths
    pub payload_length: u32,
    /// Hex SHA-256 over included transaction bytes
    pub payload_hash: String,
    /// Hex public key of the forger
    pub generator_public_key: String,
    /// Hex ed25519 signature
    pub block_signature: Option<String>,
    /// Included transactions, in block order
    pub transactions: Vec<Transaction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_account_is_virgin() {
        let account = Account::new("12345L");
        assert!(account.virgin);
        assert_eq!(account.balance, 0);
        assert!(account.delegates.is_empty());
    }

    #[test]
    fn test_transaction_type_codes() {
        assert_eq!(u8::from(TransactionType::Multi), 4);
        assert_eq!(TransactionType::try_from(7).unwrap(), TransactionType::OutTransfer);
        assert!(TransactionType::try_from(8).is_err());
    }

    #[test]
    fn test_transaction_json_uses_type_code() {
        let tx = Transaction {
            id: "ab".to_string(),
            tx_type: TransactionType::Vote,
            amount: 0,
            fee: 10,
            timestamp: 5,
            sender_public_key: "00".repeat(32),
            recipient_id: None,
            asset: Vec::new(),
            signature: None,
            sign_signature: None,
        };
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["type"], 3);
        assert_eq!(json["senderPublicKey"], "00".repeat(32));
        let back: Transaction = serde_json::from_value(json).unwrap();
        assert_eq!(back, tx);
    }
}
