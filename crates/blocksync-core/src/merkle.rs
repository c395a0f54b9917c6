//! Bitcoin merkle root over transaction ids.
//!
//! Internal nodes are `sha256d(left || right)`. Odd-length layers duplicate
//! the last element. An empty slice produces [`Hash256::ZERO`].

use crate::types::{Hash256, sha256d};

/// Compute the merkle root from a slice of transaction ids.
pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    if txids.is_empty() {
        return Hash256::ZERO;
    }

    let mut layer = txids.to_vec();
    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len().div_ceil(2));
        for pair in layer.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            let mut data = [0u8; 64];
            data[..32].copy_from_slice(left.as_bytes());
            data[32..].copy_from_slice(right.as_bytes());
            next.push(sha256d(&data));
        }
        layer = next;
    }
    layer[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_zero() {
        assert_eq!(merkle_root(&[]), Hash256::ZERO);
    }

    #[test]
    fn single_leaf_is_itself() {
        let h = Hash256([9; 32]);
        assert_eq!(merkle_root(&[h]), h);
    }

    #[test]
    fn odd_layer_duplicates_last() {
        let a = Hash256([1; 32]);
        let b = Hash256([2; 32]);
        let c = Hash256([3; 32]);
        assert_eq!(merkle_root(&[a, b, c]), merkle_root(&[a, b, c, c]));
    }

    #[test]
    fn order_matters() {
        let a = Hash256([1; 32]);
        let b = Hash256([2; 32]);
        assert_ne!(merkle_root(&[a, b]), merkle_root(&[b, a]));
    }
}
