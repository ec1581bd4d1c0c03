use sha1::{Digest, Sha1};

/// Position of a peer (or a value table) in the 32-bit XOR keyspace.
pub type PeerHash = u32;

/// `XORHash(peerid)`: the first four bytes of the SHA-1 digest, big-endian.
pub fn hash_peerid(peerid: &str) -> PeerHash {
    let digest = Sha1::digest(peerid.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

pub fn distance(a: PeerHash, b: PeerHash) -> u32 {
    a ^ b
}

/// Number of equal leading bits of two hashes; 32 when they are identical.
///
/// 0 means the most significant bit already differs, i.e. the two hashes are
/// in opposite halves of the keyspace.
pub fn first_different_bit(a: PeerHash, b: PeerHash) -> u32 {
    (a ^ b).leading_zeros()
}
