//! Partitioners map raw partition keys onto the token ring.
//!
//! Two flavors matter to the repair core: order-preserving partitioners
//! allow the Merkle tree to be split along sampled keys, while hashed
//! partitioners get an even split (you can't beat an even distribution for
//! a uniform hash).

use sha2::{Digest, Sha256};

use crate::types::{DecoratedKey, Token};

pub trait Partitioner: Send + Sync {
    /// Token image of a raw key.
    fn token(&self, key: &[u8]) -> Token;

    /// Whether token order follows raw key order.
    fn preserves_order(&self) -> bool;

    fn decorate(&self, key: impl Into<Vec<u8>>) -> DecoratedKey
    where
        Self: Sized,
    {
        let key = key.into();
        DecoratedKey { token: self.token(&key), key }
    }
}

/// Token = big-endian image of the first 16 key bytes. Key order and token
/// order coincide, so index samples are usable as split points.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderPreservingPartitioner;

impl Partitioner for OrderPreservingPartitioner {
    fn token(&self, key: &[u8]) -> Token {
        let mut image = [0u8; 16];
        let n = key.len().min(16);
        image[..n].copy_from_slice(&key[..n]);
        Token(u128::from_be_bytes(image))
    }

    fn preserves_order(&self) -> bool {
        true
    }
}

/// Token = leading 128 bits of SHA-256 of the key. Uniformly distributed,
/// order-destroying.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashedPartitioner;

impl Partitioner for HashedPartitioner {
    fn token(&self, key: &[u8]) -> Token {
        let digest = Sha256::digest(key);
        let mut image = [0u8; 16];
        image.copy_from_slice(&digest[..16]);
        Token(u128::from_be_bytes(image))
    }

    fn preserves_order(&self) -> bool {
        false
    }
}
