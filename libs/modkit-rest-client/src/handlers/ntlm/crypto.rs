//! NTLM response computation (LM/NT hashes, NTLMv1 and NTLMv2 responses).

use des::Des;
use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;

type HmacMd5 = Hmac<Md5>;

const LM_MAGIC: &[u8; 8] = b"KGS!@#$%";

pub(crate) fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Spread 56 key bits over 8 bytes and set odd parity in the low bit of each.
fn expand_des_key(key: &[u8; 7]) -> [u8; 8] {
    let bits = [
        key[0] >> 1,
        ((key[0] & 0x01) << 6) | (key[1] >> 2),
        ((key[1] & 0x03) << 5) | (key[2] >> 3),
        ((key[2] & 0x07) << 4) | (key[3] >> 4),
        ((key[3] & 0x0f) << 3) | (key[4] >> 5),
        ((key[4] & 0x1f) << 2) | (key[5] >> 6),
        ((key[5] & 0x3f) << 1) | (key[6] >> 7),
        key[6] & 0x7f,
    ];
    bits.map(|b| {
        let b = b << 1;
        if b.count_ones() % 2 == 0 { b | 1 } else { b }
    })
}

fn des_encrypt(key: &[u8; 7], block: &[u8; 8]) -> [u8; 8] {
    let cipher = Des::new(&GenericArray::from(expand_des_key(key)));
    let mut block = GenericArray::from(*block);
    cipher.encrypt_block(&mut block);
    block.into()
}

fn key_part<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut part = [0u8; N];
    part.copy_from_slice(&bytes[..N]);
    part
}

/// LM hash: DES of the magic constant under the upper-cased, 14-byte padded password.
pub(crate) fn lm_hash(password: &str) -> [u8; 16] {
    let mut padded = [0u8; 14];
    let upper = password.to_uppercase();
    let len = upper.len().min(14);
    padded[..len].copy_from_slice(&upper.as_bytes()[..len]);

    let mut hash = [0u8; 16];
    hash[..8].copy_from_slice(&des_encrypt(&key_part(&padded[..7]), LM_MAGIC));
    hash[8..].copy_from_slice(&des_encrypt(&key_part(&padded[7..]), LM_MAGIC));
    hash
}

/// NT hash: MD4 of the UTF-16LE password.
pub(crate) fn nt_hash(password: &str) -> [u8; 16] {
    Md4::digest(utf16le(password)).into()
}

/// NTLMv1 response: the 16-byte hash zero-padded to 21 bytes, split into three DES keys.
pub(crate) fn des_response(hash: &[u8; 16], challenge: &[u8; 8]) -> [u8; 24] {
    let mut keys = [0u8; 21];
    keys[..16].copy_from_slice(hash);

    let mut response = [0u8; 24];
    for (i, chunk) in keys.chunks_exact(7).enumerate() {
        response[i * 8..(i + 1) * 8].copy_from_slice(&des_encrypt(&key_part(chunk), challenge));
    }
    response
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> [u8; 16] {
    // HMAC accepts keys of any length
    let Ok(mut mac) = <HmacMd5 as Mac>::new_from_slice(key) else {
        return [0u8; 16];
    };
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// NTLMv2 key: HMAC-MD5 over the upper-cased user name and the domain, keyed by the NT hash.
pub(crate) fn ntlmv2_key(nt_hash: &[u8; 16], username: &str, domain: &str) -> [u8; 16] {
    let identity = utf16le(&(username.to_uppercase() + domain));
    hmac_md5(nt_hash, &[identity.as_slice()])
}

/// LMv2 response: 16-byte HMAC followed by the client nonce.
pub(crate) fn lmv2_response(key: &[u8; 16], server: &[u8; 8], client: &[u8; 8]) -> [u8; 24] {
    let mut response = [0u8; 24];
    response[..16].copy_from_slice(&hmac_md5(key, &[server.as_slice(), client.as_slice()]));
    response[16..].copy_from_slice(client);
    response
}

/// NTLMv2 response: proof string followed by the client blob.
///
/// `timestamp` is a Windows FILETIME (100ns ticks since 1601-01-01).
pub(crate) fn ntlmv2_response(
    key: &[u8; 16],
    server: &[u8; 8],
    client: &[u8; 8],
    timestamp: u64,
    target_info: &[u8],
) -> Vec<u8> {
    let mut blob = Vec::with_capacity(32 + target_info.len());
    blob.extend_from_slice(&[0x01, 0x01, 0, 0, 0, 0, 0, 0]);
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(client);
    blob.extend_from_slice(&[0; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0; 4]);

    let proof = hmac_md5(key, &[server.as_slice(), blob.as_slice()]);
    let mut response = proof.to_vec();
    response.extend_from_slice(&blob);
    response
}
