//! Blockchain address encoding for a group public key

use k256::{elliptic_curve::sec1::ToEncodedPoint, ProjectivePoint};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use tiny_keccak::{Hasher, Keccak};

/// Bitcoin mainnet P2PKH address of the compressed key
pub fn bitcoin_p2pkh(public_key: &ProjectivePoint) -> String {
    let encoded = public_key.to_affine().to_encoded_point(true);
    let hash = Ripemd160::digest(Sha256::digest(encoded.as_bytes()));

    let mut payload = Vec::with_capacity(25);
    payload.push(0x00);
    payload.extend_from_slice(&hash);
    let checksum = Sha256::digest(Sha256::digest(&payload));
    payload.extend_from_slice(&checksum[..4]);
    bs58::encode(payload).into_string()
}

/// Ethereum address: last 20 bytes of keccak256 over the uncompressed key
pub fn ethereum(public_key: &ProjectivePoint) -> String {
    let encoded = public_key.to_affine().to_encoded_point(false);
    let mut keccak = Keccak::v256();
    let mut hash = [0u8; 32];
    keccak.update(&encoded.as_bytes()[1..]);
    keccak.finalize(&mut hash);
    format!("0x{}", hex::encode(&hash[12..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_addresses() {
        // private key 1
        let g = ProjectivePoint::GENERATOR;
        assert_eq!(bitcoin_p2pkh(&g), "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH");
        assert_eq!(ethereum(&g), "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf");
    }
}
