// Copyright (c) 2024 Botho Foundation

//! Block, header and transaction types.
//!
//! A header is sealed either by proof of work (`Seal::Mining`) or by proof of
//! stake (`Seal::Staking`). The seal is a tagged variant rather than a header
//! subtype so the difficulty rules can dispatch on [`SealKind`] alone.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Root of an empty trie or an empty list of transactions/receipts.
pub const EMPTY_ROOT: [u8; 32] = [0u8; 32];

/// Maximum length of the free-form `extra_data` header field.
pub const MAX_EXTRA_DATA_LEN: usize = 32;

/// Render the first 8 bytes of a hash for log output.
pub fn short_hash(hash: &[u8; 32]) -> String {
    hex::encode(&hash[0..8])
}

/// Which consensus track sealed a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SealKind {
    /// Proof of work
    Mining,
    /// Proof of stake
    Staking,
}

impl SealKind {
    fn tag(self) -> u8 {
        match self {
            Self::Mining => 0,
            Self::Staking => 1,
        }
    }
}

impl std::fmt::Display for SealKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mining => write!(f, "mining"),
            Self::Staking => write!(f, "staking"),
        }
    }
}

/// Kind-specific sealing fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Seal {
    /// PoW seal: nonce plus the solver's solution bytes
    Mining { nonce: [u8; 32], solution: Vec<u8> },
    /// PoS seal: VRF-style seed, block signature and the staker's public key
    Staking {
        seed: Vec<u8>,
        signature: Vec<u8>,
        public_key: [u8; 32],
    },
}

impl Seal {
    pub fn kind(&self) -> SealKind {
        match self {
            Self::Mining { .. } => SealKind::Mining,
            Self::Staking { .. } => SealKind::Staking,
        }
    }

    /// An unsolved mining seal, used for templates and genesis.
    pub fn empty_mining() -> Self {
        Self::Mining {
            nonce: [0u8; 32],
            solution: Vec::new(),
        }
    }

    fn hash_into(&self, hasher: &mut Sha256) {
        hasher.update([self.kind().tag()]);
        match self {
            Self::Mining { nonce, solution } => {
                hasher.update(nonce);
                hasher.update((solution.len() as u64).to_le_bytes());
                hasher.update(solution);
            }
            Self::Staking {
                seed,
                signature,
                public_key,
            } => {
                hasher.update((seed.len() as u64).to_le_bytes());
                hasher.update(seed);
                hasher.update((signature.len() as u64).to_le_bytes());
                hasher.update(signature);
                hasher.update(public_key);
            }
        }
    }
}

/// Block header. Immutable once built: any change yields a different hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Hash of the parent block
    pub parent_hash: [u8; 32],

    /// Block height
    pub number: u64,

    /// Block timestamp (unix seconds)
    pub timestamp: u64,

    /// Claimed difficulty of this block
    pub difficulty: u64,

    /// Beneficiary of the block
    pub coinbase: [u8; 32],

    /// World-state root after applying this block
    pub state_root: [u8; 32],

    /// Root over the block's transactions
    pub tx_root: [u8; 32],

    /// Root over the receipts produced by executing the block
    pub receipts_root: [u8; 32],

    /// Energy budget of the block
    pub energy_limit: u64,

    /// Energy consumed by the block's transactions
    pub energy_used: u64,

    /// Free-form data, at most [`MAX_EXTRA_DATA_LEN`] bytes
    pub extra_data: Vec<u8>,

    /// PoW or PoS sealing fields
    pub seal: Seal,
}

impl BlockHeader {
    /// Compute the hash of this block header
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.parent_hash);
        hasher.update(self.number.to_le_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.difficulty.to_le_bytes());
        hasher.update(self.coinbase);
        hasher.update(self.state_root);
        hasher.update(self.tx_root);
        hasher.update(self.receipts_root);
        hasher.update(self.energy_limit.to_le_bytes());
        hasher.update(self.energy_used.to_le_bytes());
        hasher.update((self.extra_data.len() as u64).to_le_bytes());
        hasher.update(&self.extra_data);
        self.seal.hash_into(&mut hasher);
        hasher.finalize().into()
    }

    pub fn seal_kind(&self) -> SealKind {
        self.seal.kind()
    }

    pub fn is_genesis(&self) -> bool {
        self.number == 0
    }
}

/// A transaction. Its semantics belong to the executor; the import engine
/// only hashes and orders them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Sender account
    pub sender: [u8; 32],
    /// Sender-scoped sequence number
    pub nonce: u64,
    /// Maximum energy this transaction may consume
    pub energy_limit: u64,
    /// Opaque payload interpreted by the executor
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.sender);
        hasher.update(self.nonce.to_le_bytes());
        hasher.update(self.energy_limit.to_le_bytes());
        hasher.update((self.payload.len() as u64).to_le_bytes());
        hasher.update(&self.payload);
        hasher.finalize().into()
    }
}

/// Outcome of executing a single transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Hash of the transaction this receipt belongs to
    pub tx_hash: [u8; 32],
    /// Energy consumed
    pub energy_used: u64,
    /// Whether the transaction succeeded
    pub success: bool,
    /// Executor-defined output
    pub output: Vec<u8>,
}

impl Receipt {
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.tx_hash);
        hasher.update(self.energy_used.to_le_bytes());
        hasher.update([self.success as u8]);
        hasher.update((self.output.len() as u64).to_le_bytes());
        hasher.update(&self.output);
        hasher.finalize().into()
    }
}

/// Root over an ordered list of transactions
pub fn transactions_root(transactions: &[Transaction]) -> [u8; 32] {
    if transactions.is_empty() {
        return EMPTY_ROOT;
    }
    let mut hasher = Sha256::new();
    for tx in transactions {
        hasher.update(tx.hash());
    }
    hasher.finalize().into()
}

/// Root over an ordered list of receipts
pub fn receipts_root(receipts: &[Receipt]) -> [u8; 32] {
    if receipts.is_empty() {
        return EMPTY_ROOT;
    }
    let mut hasher = Sha256::new();
    for receipt in receipts {
        hasher.update(receipt.hash());
    }
    hasher.finalize().into()
}

/// A complete block. Identity is the header hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> [u8; 32] {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn parent_hash(&self) -> [u8; 32] {
        self.header.parent_hash
    }

    pub fn seal_kind(&self) -> SealKind {
        self.header.seal_kind()
    }

    pub fn is_genesis(&self) -> bool {
        self.header.is_genesis()
    }

    /// One-line description for logs: `#height (hash-prefix, kind)`
    pub fn description(&self) -> String {
        format!(
            "#{} ({}, {})",
            self.number(),
            short_hash(&self.hash()),
            self.seal_kind()
        )
    }
}
