//! Proof-of-work nonce search.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info};
use thiserror::Error;

use super::block::Block;

/// Why a nonce search gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiningStop {
    MaxAttempts,
    Timeout,
    Cancelled,
}

/// Errors that can occur during mining
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MiningError {
    #[error("Mining exceeded: {0:?}")]
    Exceeded(MiningStop),

    #[error("Invalid difficulty: {0}")]
    InvalidDifficulty(u32),
}

/// Bounds on a single nonce search
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MiningOptions {
    pub max_attempts: Option<u64>,
    pub timeout: Option<Duration>,
}

/// Checks that `hash` starts with `difficulty` zero hex characters
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let difficulty = difficulty as usize;
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}

/// Searches for a nonce whose header hash meets `difficulty`.
///
/// Works on a copy: the caller's block is never modified, so after an
/// error it can be rebuilt with fresh transactions and mined again. The
/// returned block declares `difficulty`.
pub fn mine(
    block: &Block,
    difficulty: u32,
    options: &MiningOptions,
    cancel: Option<&AtomicBool>,
) -> Result<Block, MiningError> {
    if difficulty > 64 {
        return Err(MiningError::InvalidDifficulty(difficulty));
    }

    let mut candidate = block.clone();
    candidate.difficulty = Some(difficulty);
    candidate.nonce = 0;

    let started = Instant::now();
    let mut attempts: u64 = 0;

    loop {
        if let Some(max_attempts) = options.max_attempts {
            if attempts >= max_attempts {
                debug!("Gave up mining block {} after {} attempts", block.index, attempts);
                return Err(MiningError::Exceeded(MiningStop::MaxAttempts));
            }
        }
        if cancel.map_or(false, |flag| flag.load(Ordering::Relaxed)) {
            return Err(MiningError::Exceeded(MiningStop::Cancelled));
        }
        if let Some(timeout) = options.timeout {
            if attempts % 1024 == 0 && started.elapsed() >= timeout {
                return Err(MiningError::Exceeded(MiningStop::Timeout));
            }
        }

        let hash = candidate.calculate_hash();
        attempts += 1;

        if meets_difficulty(&hash, difficulty) {
            candidate.hash = hash;
            info!(
                "Mined block {} with nonce {} after {} attempts",
                candidate.index, candidate.nonce, attempts
            );
            return Ok(candidate);
        }

        candidate.nonce = match candidate.nonce.checked_add(1) {
            Some(nonce) => nonce,
            None => return Err(MiningError::Exceeded(MiningStop::MaxAttempts)),
        };
    }
}
