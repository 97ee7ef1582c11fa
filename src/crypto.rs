//! Mesh session crypto.
//!
//! The vendor mesh runs every cryptographic step through single-block
//! AES-128-ECB with an unusual convention: key, input and output are all
//! byte-reversed around the block operation. `block_encrypt` hides that
//! quirk so the handshake and packet helpers read like the protocol
//! documentation.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;

/// Marker byte of the pairing request written to the pair characteristic.
pub const PAIR_REQUEST: u8 = 0x0C;
/// First byte of a successful pairing read.
pub const PAIR_GRANTED: u8 = 0x0D;
/// First byte of a pairing read rejecting the mesh credentials.
pub const PAIR_REJECTED: u8 = 0x0E;

/// AES-128 single block with the vendor's byte-reversal convention.
pub fn block_encrypt(key: &[u8; 16], data: &[u8; 16]) -> [u8; 16] {
    let mut k = *key;
    k.reverse();
    let mut block = *data;
    block.reverse();

    let cipher = Aes128::new(GenericArray::from_slice(&k));
    let mut buf = GenericArray::clone_from_slice(&block);
    cipher.encrypt_block(&mut buf);

    let mut out = [0u8; 16];
    out.copy_from_slice(&buf);
    out.reverse();
    out
}

/// Right-pads (or truncates) arbitrary bytes to one AES block.
pub fn pad16(value: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (dst, src) in out.iter_mut().zip(value.iter()) {
        *dst = *src;
    }
    out
}

/// Long-term mesh key: byte-wise XOR of the padded mesh name and password.
pub fn combine_credentials(mesh_name: &str, mesh_password: &str) -> [u8; 16] {
    let name = pad16(mesh_name.as_bytes());
    let password = pad16(mesh_password.as_bytes());

    let mut combined = [0u8; 16];
    for i in 0..16 {
        combined[i] = name[i] ^ password[i];
    }
    combined
}

/// Pairing request value: `0x0C || client_nonce || enc[0..8]`.
pub fn pairing_request(combined: &[u8; 16], client_nonce: &[u8; 8]) -> Vec<u8> {
    let enc = block_encrypt(combined, &pad16(client_nonce));

    let mut packet = Vec::with_capacity(17);
    packet.push(PAIR_REQUEST);
    packet.extend_from_slice(client_nonce);
    packet.extend_from_slice(&enc[0..8]);
    packet
}

/// Session key derived from both nonces under the combined mesh key.
pub fn session_key(combined: &[u8; 16], client_nonce: &[u8; 8], server_nonce: &[u8]) -> [u8; 16] {
    let mut data = [0u8; 16];
    data[0..8].copy_from_slice(client_nonce);
    for (dst, src) in data[8..16].iter_mut().zip(server_nonce.iter()) {
        *dst = *src;
    }
    block_encrypt(combined, &data)
}

/// The 6 MAC bytes in little-endian order, used as nonce material.
pub fn reverse_address(address: u64) -> [u8; 6] {
    let mut buf = [0u8; 6];
    for (i, b) in buf.iter_mut().enumerate() {
        *b = ((address >> (8 * i)) & 0xFF) as u8;
    }
    buf
}

/// Encrypts an outbound 20-byte frame in place.
///
/// Writes an authentication tag into bytes 3..5 and XORs the payload
/// bytes 5..20 with a key stream bound to the peripheral address and the
/// packet counter. Bytes 0..3 stay in the clear.
pub fn encrypt_packet(session_key: &[u8; 16], reversed_address: &[u8; 6], packet: &mut [u8; 20]) {
    let mut auth_nonce = [0u8; 16];
    auth_nonce[0..4].copy_from_slice(&reversed_address[0..4]);
    auth_nonce[4] = 0x01;
    auth_nonce[5..8].copy_from_slice(&packet[0..3]);
    auth_nonce[8] = 0x0F;

    let mut authenticator = block_encrypt(session_key, &auth_nonce);
    for i in 0..15 {
        authenticator[i] ^= packet[i + 5];
    }

    let mac = block_encrypt(session_key, &authenticator);
    packet[3..5].copy_from_slice(&mac[0..2]);

    let mut iv = [0u8; 16];
    iv[1..5].copy_from_slice(&reversed_address[0..4]);
    iv[5] = 0x01;
    iv[6..9].copy_from_slice(&packet[0..3]);

    let stream = block_encrypt(session_key, &iv);
    for i in 0..15 {
        packet[i + 5] ^= stream[i];
    }
}

/// Decrypts an inbound notification in place. The caller guarantees at
/// least 7 bytes. The tag bytes 3..5 are not re-verified; peripherals in
/// the field emit frames whose tag would not survive a strict check.
pub fn decrypt_packet(session_key: &[u8; 16], reversed_address: &[u8; 6], packet: &mut [u8]) {
    let mut iv = [0u8; 16];
    iv[1..4].copy_from_slice(&reversed_address[0..3]);
    iv[4..9].copy_from_slice(&packet[0..5]);

    let stream = block_encrypt(session_key, &iv);
    for i in 0..packet.len().saturating_sub(7).min(16) {
        packet[i + 7] ^= stream[i];
    }
}
