//! Block assembly, serialization and signing
//!
//! # Byte layout (little-endian)
//!
//! ```text
//! version              u32
//! timestamp            u32
//! previousBlock        8 bytes (first 8 bytes of the id, zero-filled)
//! numberOfTransactions u32
//! totalAmount          u64
//! totalFee             u64
//! reward               u64
//! payloadLength        u32
//! payloadHash          32 bytes
//! generatorPublicKey   32 bytes
//! blockSignature       64 bytes (only when present)
//! ```
//!
//! The signature covers SHA-256 of everything before it; the id is the hex
//! SHA-256 of the whole layout.

use crate::config::ChainConfig;
use crate::crypto::{
    address_from_public_key, decode_hex_array, hash_bytes, verify_signature, KeyPair,
    PUBLIC_KEY_HEX_LEN, SIGNATURE_HEX_LEN,
};
use crate::error::{Error, Result};
use crate::transaction::TransactionLogic;
use crate::types::{Block, Transaction, TransactionType};
use bytes::{BufMut, BytesMut};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;

/// Block format version
pub const BLOCK_VERSION: u32 = 0;

/// Length of the layout without the signature
pub const UNSIGNED_BLOCK_LENGTH: usize = 4 + 4 + 8 + 4 + 8 + 8 + 8 + 4 + 32 + 32;

const SIGNATURE_LENGTH: usize = 64;

/// Inputs to [`BlockAssembler::create`]
#[derive(Debug)]
pub struct CreateBlock<'a> {
    /// Parent block (`None` for genesis)
    pub previous_block: Option<&'a Block>,
    /// Epoch seconds of the forging slot
    pub timestamp: u32,
    /// Forger's key pair
    pub keypair: &'a KeyPair,
    /// Candidate transactions, in any order
    pub transactions: Vec<Transaction>,
    /// Reward for the new height
    pub reward: u64,
}

/// Flat block row as stored by the persistence layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct BlockRow {
    #[serde(rename = "b_id")]
    pub id: Option<String>,
    #[serde(rename = "b_version")]
    pub version: u32,
    #[serde(rename = "b_timestamp")]
    pub timestamp: u32,
    #[serde(rename = "b_height")]
    pub height: u64,
    #[serde(rename = "b_previousBlock")]
    pub previous_block: Option<String>,
    #[serde(rename = "b_numberOfTransactions")]
    pub number_of_transactions: u32,
    #[serde(rename = "b_totalAmount")]
    pub total_amount: u64,
    #[serde(rename = "b_totalFee")]
    pub total_fee: u64,
    #[serde(rename = "b_reward")]
    pub reward: u64,
    #[serde(rename = "b_payloadLength")]
    pub payload_length: u32,
    #[serde(rename = "b_payloadHash")]
    pub payload_hash: String,
    #[serde(rename = "b_generatorPublicKey")]
    pub generator_public_key: String,
    #[serde(rename = "b_blockSignature")]
    pub block_signature: String,
    #[serde(rename = "b_confirmations")]
    pub confirmations: u64,
}

/// Block read back from a row, with derived fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredBlock {
    /// Header (transactions are not part of the row)
    pub block: Block,
    /// Address of the forger
    pub generator_id: String,
    /// `totalFee + reward`, unbounded
    pub total_forged: Decimal,
    /// Confirmations reported by the store
    pub confirmations: u64,
}

/// Builds, signs and checks blocks
#[derive(Clone)]
pub struct BlockAssembler {
    transactions: Arc<dyn TransactionLogic>,
    max_payload_length: u32,
}

impl std::fmt::Debug for BlockAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockAssembler")
            .field("max_payload_length", &self.max_payload_length)
            .finish()
    }
}

fn is_hex_of_len(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_hexdigit())
}

fn checked_total(total: u64, add: u64, field: &str) -> Result<u64> {
    total
        .checked_add(add)
        .ok_or_else(|| Error::Validation(format!("{} overflows", field)))
}

impl BlockAssembler {
    /// Assembler using `transactions` for transaction bytes and checks
    pub fn new(transactions: Arc<dyn TransactionLogic>, chain: &ChainConfig) -> Self {
        Self {
            transactions,
            max_payload_length: chain.max_payload_length,
        }
    }

    /// Transaction rules in use
    pub fn transaction_logic(&self) -> &Arc<dyn TransactionLogic> {
        &self.transactions
    }

    /// Block order: `MULTI` last, then by type, then by amount (stable)
    pub fn sort_transactions(transactions: &mut [Transaction]) {
        transactions.sort_by(|a, b| {
            let a_multi = a.tx_type == TransactionType::Multi;
            let b_multi = b.tx_type == TransactionType::Multi;
            a_multi
                .cmp(&b_multi)
                .then(a.tx_type.cmp(&b.tx_type))
                .then(a.amount.cmp(&b.amount))
        });
    }

    /// Assemble, sign and normalize a new block
    ///
    /// Transactions are taken in block order until the first one that would
    /// push the payload past the maximum; it and everything after it are
    /// left out.
    pub fn create(&self, data: CreateBlock<'_>) -> Result<Block> {
        let mut transactions = data.transactions;
        Self::sort_transactions(&mut transactions);

        let mut included = Vec::with_capacity(transactions.len());
        let mut payload_hash = Sha256::new();
        let mut size: u32 = 0;
        let mut total_amount: u64 = 0;
        let mut total_fee: u64 = 0;

        for tx in transactions {
            let bytes = self.transactions.get_bytes(&tx, false, false)?;
            let next = size.saturating_add(bytes.len() as u32);
            if next > self.max_payload_length {
                break;
            }
            size = next;
            total_amount = checked_total(total_amount, tx.amount, "totalAmount")?;
            total_fee = checked_total(total_fee, tx.fee, "totalFee")?;
            payload_hash.update(&bytes);
            included.push(tx);
        }

        let (height, previous_block) = match data.previous_block {
            Some(previous) => (previous.height + 1, previous.id.clone()),
            None => (1, None),
        };

        let mut block = Block {
            id: None,
            version: BLOCK_VERSION,
            timestamp: data.timestamp,
            height,
            previous_block,
            number_of_transactions: included.len() as u32,
            total_amount,
            total_fee,
            reward: data.reward,
            payload_length: size,
            payload_hash: hex::encode(payload_hash.finalize()),
            generator_public_key: data.keypair.public_key_hex(),
            block_signature: None,
            transactions: included,
        };

        block.block_signature = Some(Self::sign(&block, data.keypair)?);
        block.id = Some(Self::get_id(&block)?);
        let block = self.object_normalize(block)?;

        tracing::debug!(
            height = block.height,
            transactions = block.number_of_transactions,
            payload_length = block.payload_length,
            "Block assembled"
        );
        Ok(block)
    }

    fn write_bytes(block: &Block, with_signature: bool) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(UNSIGNED_BLOCK_LENGTH + SIGNATURE_LENGTH);

        buf.put_u32_le(block.version);
        buf.put_u32_le(block.timestamp);

        let mut previous = [0u8; 8];
        if let Some(id) = &block.previous_block {
            for (slot, byte) in previous.iter_mut().zip(id.as_bytes()) {
                *slot = *byte;
            }
        }
        buf.put_slice(&previous);

        buf.put_u32_le(block.number_of_transactions);
        buf.put_u64_le(block.total_amount);
        buf.put_u64_le(block.total_fee);
        buf.put_u64_le(block.reward);
        buf.put_u32_le(block.payload_length);
        buf.put_slice(&decode_hex_array::<32>("payloadHash", &block.payload_hash)?);
        buf.put_slice(&decode_hex_array::<32>(
            "generatorPublicKey",
            &block.generator_public_key,
        )?);

        if with_signature {
            if let Some(signature) = &block.block_signature {
                buf.put_slice(&decode_hex_array::<64>("blockSignature", signature)?);
            }
        }

        Ok(buf.to_vec())
    }

    /// Full byte layout
    pub fn get_bytes(block: &Block) -> Result<Vec<u8>> {
        Self::write_bytes(block, true)
    }

    /// Hex signature over the unsigned layout
    pub fn sign(block: &Block, keypair: &KeyPair) -> Result<String> {
        let hash = hash_bytes(&Self::write_bytes(block, false)?);
        Ok(hex::encode(keypair.sign(&hash)))
    }

    /// Raw SHA-256 of the full layout
    pub fn get_hash(block: &Block) -> Result<[u8; 32]> {
        Ok(hash_bytes(&Self::get_bytes(block)?))
    }

    /// Hex SHA-256 of the full layout
    pub fn get_id(block: &Block) -> Result<String> {
        Ok(hex::encode(Self::get_hash(block)?))
    }

    /// Check the block signature
    ///
    /// A signature that does not verify gives `Ok(false)`; malformed hex in
    /// any field is an [`Error::Encoding`].
    pub fn verify_signature(block: &Block) -> Result<bool> {
        let signature = match &block.block_signature {
            Some(signature) => decode_hex_array::<64>("blockSignature", signature)?,
            None => return Ok(false),
        };

        let bytes = Self::get_bytes(block)?;
        let unsigned = &bytes[..bytes.len() - SIGNATURE_LENGTH];
        let hash = hash_bytes(unsigned);
        let public_key = decode_hex_array::<32>("generatorPublicKey", &block.generator_public_key)?;

        Ok(verify_signature(&hash, &signature, &public_key))
    }

    /// Check every header field and transaction, collecting all failures
    pub fn object_normalize(&self, block: Block) -> Result<Block> {
        let mut errors = Vec::new();

        if block.height < 1 {
            errors.push("height: must be at least 1".to_string());
        }
        if let Some(id) = &block.id {
            if id.is_empty() || id.len() > 64 {
                errors.push("id: must be 1-64 characters".to_string());
            }
        }
        if let Some(previous) = &block.previous_block {
            if previous.is_empty() || previous.len() > 64 {
                errors.push("previousBlock: must be 1-64 characters".to_string());
            }
        }
        if !is_hex_of_len(&block.payload_hash, 64) {
            errors.push("payloadHash: must be 64 hex characters".to_string());
        }
        if !is_hex_of_len(&block.generator_public_key, PUBLIC_KEY_HEX_LEN) {
            errors.push(format!(
                "generatorPublicKey: must be {} hex characters",
                PUBLIC_KEY_HEX_LEN
            ));
        }
        match &block.block_signature {
            Some(signature) if is_hex_of_len(signature, SIGNATURE_HEX_LEN) => {}
            Some(_) => errors.push(format!(
                "blockSignature: must be {} hex characters",
                SIGNATURE_HEX_LEN
            )),
            None => errors.push("blockSignature: missing".to_string()),
        }
        if block.payload_length > self.max_payload_length {
            errors.push(format!(
                "payloadLength: exceeds {}",
                self.max_payload_length
            ));
        }
        if block.number_of_transactions as usize != block.transactions.len() {
            errors.push(format!(
                "numberOfTransactions: {} does not match {} transactions",
                block.number_of_transactions,
                block.transactions.len()
            ));
        }

        let mut seen = HashSet::new();
        for (i, tx) in block.transactions.iter().enumerate() {
            if !seen.insert(tx.id.as_str()) {
                errors.push(format!("transactions[{}]: duplicate id {}", i, tx.id));
            }
            if let Err(tx_errors) = self.transactions.normalize(tx) {
                errors.extend(
                    tx_errors
                        .into_iter()
                        .map(|err| format!("transactions[{}].{}", i, err)),
                );
            }
        }

        if errors.is_empty() {
            Ok(block)
        } else {
            Err(Error::SchemaValidation(errors))
        }
    }

    /// Flatten a signed block into a storage row
    pub fn db_save(block: &Block) -> Result<BlockRow> {
        let id = block
            .id
            .clone()
            .ok_or_else(|| Error::Validation("id: missing".to_string()))?;
        let signature = block
            .block_signature
            .clone()
            .ok_or_else(|| Error::Validation("blockSignature: missing".to_string()))?;

        decode_hex_array::<32>("payloadHash", &block.payload_hash)?;
        decode_hex_array::<32>("generatorPublicKey", &block.generator_public_key)?;
        decode_hex_array::<64>("blockSignature", &signature)?;

        Ok(BlockRow {
            id: Some(id),
            version: block.version,
            timestamp: block.timestamp,
            height: block.height,
            previous_block: block.previous_block.clone(),
            number_of_transactions: block.number_of_transactions,
            total_amount: block.total_amount,
            total_fee: block.total_fee,
            reward: block.reward,
            payload_length: block.payload_length,
            payload_hash: block.payload_hash.clone(),
            generator_public_key: block.generator_public_key.clone(),
            block_signature: signature,
            confirmations: 0,
        })
    }

    /// Rebuild a block from a storage row; `None` if the row has no id
    pub fn db_read(row: &BlockRow) -> Result<Option<StoredBlock>> {
        let id = match &row.id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => return Ok(None),
        };

        let generator_id = address_from_public_key(&row.generator_public_key)?;
        let total_forged = Decimal::from(row.total_fee) + Decimal::from(row.reward);

        let block = Block {
            id: Some(id),
            version: row.version,
            timestamp: row.timestamp,
            height: row.height,
            previous_block: row.previous_block.clone(),
            number_of_transactions: row.number_of_transactions,
            total_amount: row.total_amount,
            total_fee: row.total_fee,
            reward: row.reward,
            payload_length: row.payload_length,
            payload_hash: row.payload_hash.clone(),
            generator_public_key: row.generator_public_key.clone(),
            block_signature: Some(row.block_signature.clone()).filter(|s| !s.is_empty()),
            transactions: Vec::new(),
        };

        Ok(Some(StoredBlock {
            block,
            generator_id,
            total_forged,
            confirmations: row.confirmations,
        }))
    }
}
