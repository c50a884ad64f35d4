//! NTLMSSP message codec: negotiate (type 1), challenge (type 2), authenticate (type 3).

use super::crypto;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

pub(crate) const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
pub(crate) const NEGOTIATE_OEM: u32 = 0x0000_0002;
pub(crate) const NEGOTIATE_NTLM: u32 = 0x0000_0200;
pub(crate) const DOMAIN_SUPPLIED: u32 = 0x0000_1000;
pub(crate) const WORKSTATION_SUPPLIED: u32 = 0x0000_2000;
pub(crate) const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
pub(crate) const NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;

const NEGOTIATE_FLAGS: u32 = NEGOTIATE_UNICODE
    | NEGOTIATE_OEM
    | NEGOTIATE_NTLM
    | DOMAIN_SUPPLIED
    | WORKSTATION_SUPPLIED
    | NEGOTIATE_ALWAYS_SIGN;

const NEGOTIATE_HEADER_LEN: usize = 32;
const CHALLENGE_MIN_LEN: usize = 32;
const AUTHENTICATE_HEADER_LEN: usize = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("message is {0} bytes, too short for a challenge")]
    Truncated(usize),
    #[error("missing NTLMSSP signature")]
    BadSignature,
    #[error("expected message type 2, got {0}")]
    UnexpectedType(u32),
    #[error("{field} buffer at {offset}+{len} exceeds message length {total}")]
    BufferOutOfRange {
        field: &'static str,
        offset: usize,
        len: usize,
        total: usize,
    },
}

/// Decoded server challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeMessage {
    pub flags: u32,
    pub server_challenge: [u8; 8],
    pub target_name: Vec<u8>,
    /// AV pairs; present only when the server negotiated target info.
    pub target_info: Option<Vec<u8>>,
}

/// Client side inputs of an authenticate message that are not credentials.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClientNonce {
    pub(crate) challenge: [u8; 8],
    /// Windows FILETIME
    pub(crate) timestamp: u64,
}

impl ClientNonce {
    pub(crate) fn generate() -> Self {
        const UNIX_EPOCH_AS_FILETIME: u64 = 116_444_736_000_000_000;
        let since_epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let ticks = u64::try_from(since_epoch.as_nanos().div_euclid(100)).unwrap_or(u64::MAX);
        Self {
            challenge: rand::random(),
            timestamp: UNIX_EPOCH_AS_FILETIME.saturating_add(ticks),
        }
    }
}

pub(crate) struct Identity<'a> {
    pub(crate) username: &'a str,
    pub(crate) password: &'a str,
    pub(crate) domain: &'a str,
    pub(crate) workstation: &'a str,
}

fn security_buffer(out: &mut Vec<u8>, len: usize, offset: usize) {
    let len = u16::try_from(len).unwrap_or(u16::MAX);
    let offset = u32::try_from(offset).unwrap_or(u32::MAX);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
}

/// Type 1 message. Workstation and domain are sent upper-cased as OEM text.
pub(crate) fn encode_negotiate(workstation: &str, domain: &str) -> Vec<u8> {
    let workstation = workstation.to_uppercase();
    let domain = domain.to_uppercase();

    let mut flags = NEGOTIATE_FLAGS;
    if domain.is_empty() {
        flags &= !DOMAIN_SUPPLIED;
    }
    if workstation.is_empty() {
        flags &= !WORKSTATION_SUPPLIED;
    }

    let workstation_offset = NEGOTIATE_HEADER_LEN;
    let domain_offset = workstation_offset + workstation.len();

    let mut out = Vec::with_capacity(domain_offset + domain.len());
    out.extend_from_slice(SIGNATURE);
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    security_buffer(&mut out, domain.len(), domain_offset);
    security_buffer(&mut out, workstation.len(), workstation_offset);
    out.extend_from_slice(workstation.as_bytes());
    out.extend_from_slice(domain.as_bytes());
    out
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn read_buffer(data: &[u8], at: usize, field: &'static str) -> Result<Vec<u8>, MessageError> {
    let len = usize::from(read_u16(data, at));
    let offset = usize::try_from(read_u32(data, at + 4)).unwrap_or(usize::MAX);
    data.get(offset..offset.saturating_add(len))
        .map(<[u8]>::to_vec)
        .ok_or(MessageError::BufferOutOfRange {
            field,
            offset,
            len,
            total: data.len(),
        })
}

impl ChallengeMessage {
    /// Decode a type 2 message.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError`] on a short, mistyped or internally inconsistent message.
    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        if data.len() < CHALLENGE_MIN_LEN {
            return Err(MessageError::Truncated(data.len()));
        }
        if &data[..8] != SIGNATURE {
            return Err(MessageError::BadSignature);
        }
        let kind = read_u32(data, 8);
        if kind != 2 {
            return Err(MessageError::UnexpectedType(kind));
        }

        let target_name = read_buffer(data, 12, "target name")?;
        let flags = read_u32(data, 20);
        let mut server_challenge = [0u8; 8];
        server_challenge.copy_from_slice(&data[24..32]);

        let target_info = if flags & NEGOTIATE_TARGET_INFO != 0 && data.len() >= 48 {
            Some(read_buffer(data, 40, "target info")?)
        } else {
            None
        };

        Ok(Self {
            flags,
            server_challenge,
            target_name,
            target_info,
        })
    }
}

/// Type 3 message answering `challenge`.
///
/// Uses NTLMv2 when the challenge carries target info, NTLMv1 otherwise.
/// Flags echo the challenge; strings are UTF-16LE when unicode was negotiated.
pub(crate) fn encode_authenticate(
    identity: &Identity<'_>,
    challenge: &ChallengeMessage,
    nonce: ClientNonce,
) -> Vec<u8> {
    let (lm_response, nt_response) = match &challenge.target_info {
        Some(target_info) => {
            let key = crypto::ntlmv2_key(
                &crypto::nt_hash(identity.password),
                identity.username,
                identity.domain,
            );
            (
                crypto::lmv2_response(&key, &challenge.server_challenge, &nonce.challenge).to_vec(),
                crypto::ntlmv2_response(
                    &key,
                    &challenge.server_challenge,
                    &nonce.challenge,
                    nonce.timestamp,
                    target_info,
                ),
            )
        }
        None => (
            crypto::des_response(&crypto::lm_hash(identity.password), &challenge.server_challenge)
                .to_vec(),
            crypto::des_response(&crypto::nt_hash(identity.password), &challenge.server_challenge)
                .to_vec(),
        ),
    };

    let encode = |s: &str| {
        if challenge.flags & NEGOTIATE_UNICODE != 0 {
            crypto::utf16le(s)
        } else {
            s.as_bytes().to_vec()
        }
    };
    let domain = encode(&identity.domain.to_uppercase());
    let user = encode(identity.username);
    let workstation = encode(&identity.workstation.to_uppercase());

    let domain_offset = AUTHENTICATE_HEADER_LEN;
    let user_offset = domain_offset + domain.len();
    let workstation_offset = user_offset + user.len();
    let lm_offset = workstation_offset + workstation.len();
    let nt_offset = lm_offset + lm_response.len();
    let session_key_offset = nt_offset + nt_response.len();

    let mut out = Vec::with_capacity(session_key_offset);
    out.extend_from_slice(SIGNATURE);
    out.extend_from_slice(&3u32.to_le_bytes());
    security_buffer(&mut out, lm_response.len(), lm_offset);
    security_buffer(&mut out, nt_response.len(), nt_offset);
    security_buffer(&mut out, domain.len(), domain_offset);
    security_buffer(&mut out, user.len(), user_offset);
    security_buffer(&mut out, workstation.len(), workstation_offset);
    security_buffer(&mut out, 0, session_key_offset);
    out.extend_from_slice(&challenge.flags.to_le_bytes());
    out.extend_from_slice(&domain);
    out.extend_from_slice(&user);
    out.extend_from_slice(&workstation);
    out.extend_from_slice(&lm_response);
    out.extend_from_slice(&nt_response);
    out
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    const TYPE1: &str = "TlRMTVNTUAABAAAAA7IAAAoACgApAAAACQAJACAAAABMSUdIVENJVFlVUlNBLU1JTk9S";
    const TYPE2: &str = "TlRMTVNTUAACAAAAAAAAACgAAAABggAAU3J2Tm9uY2UAAAAAAAAAAA==";
    const TYPE3: &str = "TlRMTVNTUAADAAAAGAAYAHIAAAAYABgAigAAABQAFABAAAAADAAMAFQAAAASABIAYAAAAAAAAACiAAAAAYIAAFUAUgBTAEEALQBNAEkATgBPAFIAWgBhAHAAaABvAGQATABJAEcASABUAEMASQBUAFkArYfKbe/jRoW5xDxHeoxC1gBmfWiS5+iX4OAN4xBKG/IFPwfH3agtPEia6YnhsADT";

    fn zaphod() -> Identity<'static> {
        Identity {
            username: "Zaphod",
            password: "Beeblebrox",
            domain: "Ursa-Minor",
            workstation: "LightCity",
        }
    }

    #[test]
    fn test_negotiate_message() {
        assert_eq!(STANDARD.encode(encode_negotiate("LightCity", "Ursa-Minor")), TYPE1);
    }

    #[test]
    fn test_negotiate_without_domain_drops_flag() {
        let message = encode_negotiate("ws", "");
        let flags = read_u32(&message, 12);
        assert_eq!(flags & DOMAIN_SUPPLIED, 0);
        assert_ne!(flags & WORKSTATION_SUPPLIED, 0);
        assert_eq!(message.len(), NEGOTIATE_HEADER_LEN + 2);
    }

    #[test]
    fn test_challenge_decode() {
        let challenge = ChallengeMessage::decode(&STANDARD.decode(TYPE2).unwrap()).unwrap();
        assert_eq!(challenge.flags, 0x0000_8201);
        assert_eq!(&challenge.server_challenge, b"SrvNonce");
        assert!(challenge.target_name.is_empty());
        assert!(challenge.target_info.is_none());
    }

    #[test]
    fn test_challenge_decode_errors() {
        assert_eq!(ChallengeMessage::decode(b"NTLMSSP\0"), Err(MessageError::Truncated(8)));

        let mut bad = STANDARD.decode(TYPE2).unwrap();
        bad[0] = b'X';
        assert_eq!(ChallengeMessage::decode(&bad), Err(MessageError::BadSignature));

        let mut padded = STANDARD.decode(TYPE1).unwrap();
        padded.resize(40, 0);
        assert_eq!(ChallengeMessage::decode(&padded), Err(MessageError::UnexpectedType(1)));

        let mut out_of_range = STANDARD.decode(TYPE2).unwrap();
        out_of_range[12] = 0xff;
        assert!(matches!(
            ChallengeMessage::decode(&out_of_range),
            Err(MessageError::BufferOutOfRange { field: "target name", .. })
        ));
    }

    #[test]
    fn test_authenticate_ntlmv1() {
        let challenge = ChallengeMessage::decode(&STANDARD.decode(TYPE2).unwrap()).unwrap();
        let nonce = ClientNonce {
            challenge: [0; 8],
            timestamp: 0,
        };
        assert_eq!(
            STANDARD.encode(encode_authenticate(&zaphod(), &challenge, nonce)),
            TYPE3
        );
    }

    #[test]
    fn test_authenticate_ntlmv2_when_target_info_present() {
        let target_info = hex::decode(
            "02000c0044006f006d00610069006e0001000c0053006500720076006500720000000000",
        )
        .unwrap();
        let challenge = ChallengeMessage {
            flags: NEGOTIATE_UNICODE | NEGOTIATE_NTLM | NEGOTIATE_TARGET_INFO,
            server_challenge: [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef],
            target_name: Vec::new(),
            target_info: Some(target_info.clone()),
        };
        let nonce = ClientNonce {
            challenge: [0xaa; 8],
            timestamp: 0,
        };
        let identity = Identity {
            username: "User",
            password: "Password",
            domain: "Domain",
            workstation: "COMPUTER",
        };

        let message = encode_authenticate(&identity, &challenge, nonce);

        let lm = read_buffer(&message, 12, "lm").unwrap();
        let nt = read_buffer(&message, 20, "nt").unwrap();
        assert_eq!(hex::encode(lm), "86c35097ac9cec102554764a57cccc19aaaaaaaaaaaaaaaa");
        assert_eq!(hex::encode(&nt[..16]), "68cd0ab851e51c96aabc927bebef6a1c");
        assert_eq!(nt.len(), 48 + target_info.len());
        assert_eq!(read_u32(&message, 60), challenge.flags);
    }

    #[test]
    fn test_generated_nonce_is_after_unix_epoch() {
        let nonce = ClientNonce::generate();
        assert!(nonce.timestamp > 116_444_736_000_000_000);
    }
}
