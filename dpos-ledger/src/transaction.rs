//! Transaction codec and balance effects
//!
//! Block assembly needs three things from a transaction: its canonical
//! bytes, a schema check, and the account diffs it causes. They sit behind
//! [`TransactionLogic`] so the block and chain code never depend on the
//! type-specific rules.
//!
//! # Byte layout (little-endian)
//!
//! ```text
//! type            u8
//! timestamp       u32
//! senderPublicKey 32 bytes
//! recipientId     u8 length + UTF-8 (length 0 when absent)
//! amount          u64
//! asset           raw bytes
//! signature       64 bytes   (omitted when absent or skipped)
//! signSignature   64 bytes   (omitted when absent or skipped)
//! ```

use crate::account::{AccountDiff, Counter, Replace};
use crate::crypto::{
    address_from_public_key, decode_hex_array, hash_bytes, verify_signature, KeyPair,
    PUBLIC_KEY_HEX_LEN, SIGNATURE_HEX_LEN,
};
use crate::error::{Error, Result};
use crate::types::{Transaction, TransactionType};
use bytes::{BufMut, BytesMut};

/// Longest accepted recipient address
pub const MAX_RECIPIENT_LENGTH: usize = 50;

/// Transaction rules used by block assembly and application
pub trait TransactionLogic: Send + Sync {
    /// Canonical bytes, optionally without the signatures
    fn get_bytes(
        &self,
        tx: &Transaction,
        skip_signature: bool,
        skip_second_signature: bool,
    ) -> Result<Vec<u8>>;

    /// Check every field, collecting all failures
    fn normalize(&self, tx: &Transaction) -> std::result::Result<(), Vec<String>>;

    /// Check the sender's signature; malformed hex is an error
    fn verify(&self, tx: &Transaction) -> Result<bool> {
        let signature = match &tx.signature {
            Some(signature) => decode_hex_array::<64>("signature", signature)?,
            None => return Ok(false),
        };
        let public_key = decode_hex_array::<32>("senderPublicKey", &tx.sender_public_key)?;
        let hash = hash_bytes(&self.get_bytes(tx, true, true)?);
        Ok(verify_signature(&hash, &signature, &public_key))
    }

    /// Account diffs caused by confirming the transaction, sender first
    fn effects(&self, tx: &Transaction) -> Result<Vec<(String, AccountDiff)>>;
}

fn is_hex(value: &str) -> bool {
    value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Generic rules: every type pays its fee, `SEND` also moves its amount
#[derive(Debug, Clone)]
pub struct CanonicalTransactions {
    total_amount: u64,
}

impl CanonicalTransactions {
    /// Rules bounded by the total supply
    pub fn new(total_amount: i64) -> Self {
        Self {
            total_amount: total_amount.max(0) as u64,
        }
    }

    /// Build and sign a transaction
    pub fn create(
        &self,
        tx_type: TransactionType,
        amount: u64,
        fee: u64,
        timestamp: u32,
        recipient_id: Option<String>,
        keypair: &KeyPair,
    ) -> Result<Transaction> {
        let mut tx = Transaction {
            id: String::new(),
            tx_type,
            amount,
            fee,
            timestamp,
            sender_public_key: keypair.public_key_hex(),
            recipient_id,
            asset: Vec::new(),
            signature: None,
            sign_signature: None,
        };

        let hash = hash_bytes(&self.get_bytes(&tx, true, true)?);
        tx.signature = Some(hex::encode(keypair.sign(&hash)));
        tx.id = self.get_id(&tx)?;
        Ok(tx)
    }

    /// Hex SHA-256 of the full bytes
    pub fn get_id(&self, tx: &Transaction) -> Result<String> {
        Ok(hex::encode(hash_bytes(&self.get_bytes(tx, false, false)?)))
    }
}

impl TransactionLogic for CanonicalTransactions {
    fn get_bytes(
        &self,
        tx: &Transaction,
        skip_signature: bool,
        skip_second_signature: bool,
    ) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(1 + 4 + 32 + 1 + 8 + tx.asset.len() + 128);

        buf.put_u8(tx.tx_type.into());
        buf.put_u32_le(tx.timestamp);
        buf.put_slice(&decode_hex_array::<32>("senderPublicKey", &tx.sender_public_key)?);

        let recipient = tx.recipient_id.as_deref().unwrap_or("");
        if recipient.len() > MAX_RECIPIENT_LENGTH {
            return Err(Error::Validation(format!(
                "recipientId longer than {} bytes",
                MAX_RECIPIENT_LENGTH
            )));
        }
        buf.put_u8(recipient.len() as u8);
        buf.put_slice(recipient.as_bytes());

        buf.put_u64_le(tx.amount);
        buf.put_slice(&tx.asset);

        if !skip_signature {
            if let Some(signature) = &tx.signature {
                buf.put_slice(&decode_hex_array::<64>("signature", signature)?);
            }
        }
        if !skip_second_signature {
            if let Some(signature) = &tx.sign_signature {
                buf.put_slice(&decode_hex_array::<64>("signSignature", signature)?);
            }
        }

        Ok(buf.to_vec())
    }

    fn normalize(&self, tx: &Transaction) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if tx.id.is_empty() || tx.id.len() > 64 || !is_hex(&tx.id) {
            errors.push("id: must be 1-64 hex characters".to_string());
        }
        if tx.sender_public_key.len() != PUBLIC_KEY_HEX_LEN || !is_hex(&tx.sender_public_key) {
            errors.push(format!(
                "senderPublicKey: must be {} hex characters",
                PUBLIC_KEY_HEX_LEN
            ));
        }
        match &tx.signature {
            Some(signature) if signature.len() == SIGNATURE_HEX_LEN && is_hex(signature) => {}
            Some(_) => errors.push(format!(
                "signature: must be {} hex characters",
                SIGNATURE_HEX_LEN
            )),
            None => errors.push("signature: missing".to_string()),
        }
        if let Some(signature) = &tx.sign_signature {
            if signature.len() != SIGNATURE_HEX_LEN || !is_hex(signature) {
                errors.push(format!(
                    "signSignature: must be {} hex characters",
                    SIGNATURE_HEX_LEN
                ));
            }
        }
        match (&tx.recipient_id, tx.tx_type) {
            (Some(recipient), _) if recipient.is_empty() || recipient.len() > MAX_RECIPIENT_LENGTH => {
                errors.push(format!(
                    "recipientId: must be 1-{} characters",
                    MAX_RECIPIENT_LENGTH
                ))
            }
            (None, TransactionType::Send) => errors.push("recipientId: missing".to_string()),
            _ => {}
        }
        if tx.amount > self.total_amount {
            errors.push(format!("amount: exceeds {}", self.total_amount));
        }
        if tx.tx_type != TransactionType::Send && tx.amount != 0 {
            errors.push(format!("amount: must be 0 for type {}", tx.tx_type));
        }
        if tx.fee > self.total_amount {
            errors.push(format!("fee: exceeds {}", self.total_amount));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn effects(&self, tx: &Transaction) -> Result<Vec<(String, AccountDiff)>> {
        let sender = address_from_public_key(&tx.sender_public_key)?;
        let moved = match tx.tx_type {
            TransactionType::Send => tx.amount,
            _ => 0,
        };
        let spent = moved
            .checked_add(tx.fee)
            .and_then(|spent| i64::try_from(spent).ok())
            .ok_or_else(|| Error::Validation(format!("transaction {} spends too much", tx.id)))?;

        let mut effects = vec![(
            sender,
            AccountDiff::new()
                .replace(Replace::PublicKey(tx.sender_public_key.clone()))
                .adjust(Counter::Balance, -spent)
                .adjust(Counter::UBalance, -spent),
        )];

        if moved > 0 {
            let recipient = tx.recipient_id.clone().ok_or_else(|| {
                Error::Validation(format!("transaction {} has no recipient", tx.id))
            })?;
            // moved <= spent, which fits i64
            let credit = moved as i64;
            effects.push((
                recipient,
                AccountDiff::new()
                    .adjust(Counter::Balance, credit)
                    .adjust(Counter::UBalance, credit),
            ));
        }

        Ok(effects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logic() -> CanonicalTransactions {
        CanonicalTransactions::new(10_000_000_000_000_000)
    }

    fn send(keypair: &KeyPair) -> Transaction {
        logic()
            .create(
                TransactionType::Send,
                1_000,
                10,
                42,
                Some("16313739661670634666L".to_string()),
                keypair,
            )
            .unwrap()
    }

    #[test]
    fn test_byte_layout() {
        let keypair = KeyPair::from_seed(&[7u8; 32]);
        let tx = send(&keypair);
        let unsigned = logic().get_bytes(&tx, true, true).unwrap();

        assert_eq!(unsigned[0], 0);
        assert_eq!(&unsigned[1..5], &42u32.to_le_bytes());
        assert_eq!(&unsigned[5..37], &keypair.public_key());
        assert_eq!(unsigned[37] as usize, "16313739661670634666L".len());
        let amount_at = 38 + unsigned[37] as usize;
        assert_eq!(&unsigned[amount_at..amount_at + 8], &1_000u64.to_le_bytes());
        assert_eq!(unsigned.len(), amount_at + 8);

        let signed = logic().get_bytes(&tx, false, false).unwrap();
        assert_eq!(signed.len(), unsigned.len() + 64);
    }

    #[test]
    fn test_signature_and_id() {
        let keypair = KeyPair::from_seed(&[7u8; 32]);
        let tx = send(&keypair);
        assert!(logic().verify(&tx).unwrap());
        assert_eq!(tx.id, logic().get_id(&tx).unwrap());
        assert!(logic().normalize(&tx).is_ok());

        let mut tampered = tx.clone();
        tampered.amount += 1;
        assert!(!logic().verify(&tampered).unwrap());
    }

    #[test]
    fn test_normalize_collects_errors() {
        let keypair = KeyPair::from_seed(&[7u8; 32]);
        let mut tx = send(&keypair);
        tx.id = String::new();
        tx.recipient_id = None;
        tx.signature = Some("abc".to_string());

        let errors = logic().normalize(&tx).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.starts_with("recipientId")));
    }

    #[test]
    fn test_effects() {
        let keypair = KeyPair::from_seed(&[7u8; 32]);
        let tx = send(&keypair);
        let effects = logic().effects(&tx).unwrap();

        assert_eq!(effects.len(), 2);
        assert_eq!(effects[0].0, keypair.address());
        assert!(effects[0]
            .1
            .changes
            .contains(&crate::account::Change::Adjust(Counter::Balance, -1_010)));
        assert_eq!(effects[1].0, "16313739661670634666L");

        let vote = logic()
            .create(TransactionType::Vote, 0, 100, 1, None, &keypair)
            .unwrap();
        let effects = logic().effects(&vote).unwrap();
        assert_eq!(effects.len(), 1);
        assert!(effects[0]
            .1
            .changes
            .contains(&crate::account::Change::Adjust(Counter::UBalance, -100)));
    }
}
