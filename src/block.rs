//! Ledger blocks: numbered groupings of formulas linked into a keccak-256 hash
//! chain, optionally signed by an ed25519 author key.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use tiny_keccak::{Hasher, Keccak};

/// `prev_hash` of block 0 and the merkle root of an empty block.
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Errors from block integrity checks.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BlockError {
    #[error("expected block number {expected}, found {found}")]
    NumberGap { expected: u64, found: u64 },
    #[error("merkle root does not match formula ids")]
    MerkleMismatch,
    #[error("prev_hash does not match the preceding block")]
    BrokenLink,
    #[error("stored hash does not match block contents")]
    HashMismatch,
    #[error("signature present without author key")]
    MissingAuthor,
    #[error("invalid block signature")]
    InvalidSignature,
    #[error("key error: {0}")]
    KeyError(String),
}

/// Caller-supplied block payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDraft {
    #[serde(default)]
    pub formula_ids: Vec<u64>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl BlockDraft {
    pub fn with_formulas(formula_ids: impl Into<Vec<u64>>) -> Self {
        Self {
            formula_ids: formula_ids.into(),
            data: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    #[serde(default)]
    pub block_number: u64,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub formula_ids: Vec<u64>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub merkle_root: String,
    #[serde(default)]
    pub prev_hash: String,
    #[serde(default)]
    pub hash: String,
    /// Hex ed25519 public key of the signer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Hex ed25519 signature over the raw block hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Block {
    /// Build the block that follows `prev` (or the first block when `prev` is None).
    pub fn seal(draft: BlockDraft, timestamp: i64, prev: Option<&Block>) -> Self {
        let (block_number, prev_hash) = match prev {
            Some(p) => (p.block_number + 1, p.hash.clone()),
            None => (0, ZERO_HASH.to_string()),
        };
        let mut block = Self {
            block_number,
            timestamp,
            merkle_root: merkle_root(&draft.formula_ids),
            formula_ids: draft.formula_ids,
            data: draft.data,
            prev_hash,
            hash: String::new(),
            author: None,
            signature: None,
        };
        block.hash = block.compute_hash();
        block
    }

    /// Caller payload, without the chain fields.
    pub fn draft(&self) -> BlockDraft {
        BlockDraft {
            formula_ids: self.formula_ids.clone(),
            data: self.data.clone(),
        }
    }

    /// keccak256(number || timestamp || merkle_root || prev_hash || data)
    pub fn compute_hash(&self) -> String {
        let mut hasher = Keccak::v256();
        hasher.update(&self.block_number.to_be_bytes());
        hasher.update(&self.timestamp.to_be_bytes());
        hasher.update(self.merkle_root.as_bytes());
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(self.data.to_string().as_bytes());
        let mut output = [0u8; 32];
        hasher.finalize(&mut output);
        hex::encode(output)
    }

    /// Sign the block hash with the author's key.
    pub fn sign(&mut self, key: &SigningKey) {
        let sig = key.sign(self.hash.as_bytes());
        self.author = Some(hex::encode(key.verifying_key().to_bytes()));
        self.signature = Some(hex::encode(sig.to_bytes()));
    }

    /// Check the block's own contents and its link to `prev`.
    pub fn verify(&self, prev: Option<&Block>) -> Result<(), BlockError> {
        let (expected_number, expected_prev) = match prev {
            Some(p) => (p.block_number + 1, p.hash.as_str()),
            None => (0, ZERO_HASH),
        };
        if self.block_number != expected_number {
            return Err(BlockError::NumberGap {
                expected: expected_number,
                found: self.block_number,
            });
        }
        if self.merkle_root != merkle_root(&self.formula_ids) {
            return Err(BlockError::MerkleMismatch);
        }
        if self.prev_hash != expected_prev {
            return Err(BlockError::BrokenLink);
        }
        if self.hash != self.compute_hash() {
            return Err(BlockError::HashMismatch);
        }
        self.verify_signature()
    }

    /// Unsigned blocks pass.
    pub fn verify_signature(&self) -> Result<(), BlockError> {
        let Some(sig_hex) = &self.signature else {
            return Ok(());
        };
        let author = self.author.as_ref().ok_or(BlockError::MissingAuthor)?;

        let pk_bytes: [u8; 32] = hex::decode(author)
            .map_err(|e| BlockError::KeyError(e.to_string()))?
            .try_into()
            .map_err(|_| BlockError::KeyError("invalid public key length".into()))?;
        let verifying_key = VerifyingKey::from_bytes(&pk_bytes)
            .map_err(|e| BlockError::KeyError(e.to_string()))?;

        let sig_bytes: [u8; 64] = hex::decode(sig_hex)
            .map_err(|_| BlockError::InvalidSignature)?
            .try_into()
            .map_err(|_| BlockError::InvalidSignature)?;
        let sig = Signature::from_bytes(&sig_bytes);

        verifying_key
            .verify(self.hash.as_bytes(), &sig)
            .map_err(|_| BlockError::InvalidSignature)
    }
}

/// Root over the block's formula ids. Empty blocks get [`ZERO_HASH`].
pub fn merkle_root(formula_ids: &[u64]) -> String {
    if formula_ids.is_empty() {
        return ZERO_HASH.to_string();
    }
    let mut level: Vec<[u8; 32]> = formula_ids
        .iter()
        .map(|id| keccak256(&id.to_be_bytes()))
        .collect();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [a, b] => {
                    let mut joined = [0u8; 64];
                    joined[..32].copy_from_slice(a);
                    joined[32..].copy_from_slice(b);
                    keccak256(&joined)
                }
                // odd node is promoted unchanged
                [a] => *a,
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();
    }
    hex::encode(level[0])
}

fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(data);
    hasher.finalize(&mut output);
    output
}
