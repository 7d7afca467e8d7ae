// Copyright (c) 2024 Botho Foundation
//
//! Deterministic executor over a flat key/value state.
//!
//! A transaction payload `key=value` writes one entry. A payload without `=`
//! produces a failed receipt and no change. A payload starting with `fail`
//! rejects the whole block. Every block credits its coinbase with
//! [`BLOCK_REWARD`], so consecutive blocks always have distinct state roots.

use hybrid_chain::block::{receipts_root, transactions_root, Block, Receipt};
use hybrid_chain::executor::{ExecutionError, ExecutionOutcome, Executor};
use hybrid_chain::state::StateTracker;

/// Credited to the coinbase of every block
pub const BLOCK_REWARD: u64 = 1_000;

/// Energy charged per transaction before payload bytes
pub const BASE_ENERGY: u64 = 21_000;

pub fn balance_key(coinbase: &[u8; 32]) -> Vec<u8> {
    let mut key = b"balance:".to_vec();
    key.extend_from_slice(coinbase);
    key
}

pub fn decode_balance(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes.try_into().expect("balance is 8 bytes"))
}

pub struct KvExecutor;

impl Executor for KvExecutor {
    fn execute(
        &self,
        block: &Block,
        state: &mut StateTracker<'_>,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let mut receipts = Vec::with_capacity(block.transactions.len());
        let mut energy_used = 0u64;

        for (index, tx) in block.transactions.iter().enumerate() {
            if tx.payload.starts_with(b"fail") {
                return Err(ExecutionError::Rejected {
                    index,
                    reason: "payload requested failure".to_string(),
                });
            }

            let energy = BASE_ENERGY + tx.payload.len() as u64;
            energy_used += energy;
            if energy_used > block.header.energy_limit {
                return Err(ExecutionError::EnergyExceeded {
                    used: energy_used,
                    limit: block.header.energy_limit,
                });
            }

            let success = match tx.payload.iter().position(|b| *b == b'=') {
                Some(split) => {
                    state.put(
                        tx.payload[..split].to_vec(),
                        tx.payload[split + 1..].to_vec(),
                    );
                    true
                }
                None => false,
            };

            receipts.push(Receipt {
                tx_hash: tx.hash(),
                energy_used: energy,
                success,
                output: Vec::new(),
            });
        }

        let key = balance_key(&block.header.coinbase);
        let balance = state.get(&key)?.map(|b| decode_balance(&b)).unwrap_or(0);
        state.put(key, (balance + BLOCK_REWARD).to_le_bytes().to_vec());

        Ok(ExecutionOutcome {
            state_root: state.root()?,
            receipts_root: receipts_root(&receipts),
            transactions_root: transactions_root(&block.transactions),
            receipts,
            energy_used,
        })
    }
}
