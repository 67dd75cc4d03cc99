//! NTLM messages carried in SSPI tokens.
//!
//! The client puts a NEGOTIATE message in LOGIN7's SSPI field, the server
//! answers with an SSPI token holding the CHALLENGE, and the client replies
//! with an AUTHENTICATE message in an NTLM packet. Only NTLMv2 responses are
//! produced.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;

use crate::error::AuthError;
use crate::fedauth::utf16le;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";
const NEGOTIATE: u32 = 1;
const CHALLENGE: u32 = 2;
const AUTHENTICATE: u32 = 3;

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const NEGOTIATE_OEM: u32 = 0x0000_0002;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const DOMAIN_SUPPLIED: u32 = 0x0000_1000;
const WORKSTATION_SUPPLIED: u32 = 0x0000_2000;
const ALWAYS_SIGN: u32 = 0x0000_8000;
const EXTENDED_SESSION_SECURITY: u32 = 0x0008_0000;
const TARGET_INFO: u32 = 0x0080_0000;
const NEGOTIATE_128: u32 = 0x2000_0000;
const NEGOTIATE_56: u32 = 0x8000_0000;

const NEGOTIATE_HEADER_LEN: usize = 32;
const AUTHENTICATE_HEADER_LEN: usize = 64;

/// Seconds between 1601-01-01 and 1970-01-01.
const FILETIME_EPOCH_OFFSET: u64 = 11_644_473_600;

type HmacMd5 = Hmac<Md5>;

/// Build the NEGOTIATE message for `domain` and `workstation`.
#[must_use]
pub fn negotiate(domain: &str, workstation: &str) -> Bytes {
    let flags = NEGOTIATE_UNICODE
        | NEGOTIATE_OEM
        | REQUEST_TARGET
        | NEGOTIATE_NTLM
        | DOMAIN_SUPPLIED
        | WORKSTATION_SUPPLIED
        | ALWAYS_SIGN
        | EXTENDED_SESSION_SECURITY
        | TARGET_INFO
        | NEGOTIATE_128
        | NEGOTIATE_56;

    // OEM strings in the payload
    let domain = domain.as_bytes();
    let workstation = workstation.as_bytes();

    let mut buf = BytesMut::with_capacity(NEGOTIATE_HEADER_LEN + domain.len() + workstation.len());
    buf.put_slice(SIGNATURE);
    buf.put_u32_le(NEGOTIATE);
    buf.put_u32_le(flags);
    let mut offset = NEGOTIATE_HEADER_LEN;
    put_security_buffer(&mut buf, domain.len(), offset);
    offset += domain.len();
    put_security_buffer(&mut buf, workstation.len(), offset);
    buf.put_slice(domain);
    buf.put_slice(workstation);
    buf.freeze()
}

/// The parts of a CHALLENGE message needed to answer it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Negotiated flags.
    pub flags: u32,
    /// 8-byte server challenge.
    pub server_challenge: [u8; 8],
    /// Raw target information block.
    pub target_info: Bytes,
}

impl Challenge {
    /// Parse a CHALLENGE message from an SSPI token.
    pub fn parse(token: &[u8]) -> Result<Self, AuthError> {
        if token.len() < 48 {
            return Err(AuthError::Ntlm(format!(
                "challenge message too short: {} bytes",
                token.len()
            )));
        }
        if &token[..8] != SIGNATURE {
            return Err(AuthError::Ntlm("invalid NTLMSSP signature".into()));
        }
        let message_type = u32::from_le_bytes([token[8], token[9], token[10], token[11]]);
        if message_type != CHALLENGE {
            return Err(AuthError::Ntlm(format!(
                "expected challenge message, got type {message_type}"
            )));
        }

        let flags = u32::from_le_bytes([token[20], token[21], token[22], token[23]]);
        let mut server_challenge = [0u8; 8];
        server_challenge.copy_from_slice(&token[24..32]);

        let info_len = u16::from_le_bytes([token[40], token[41]]) as usize;
        let info_offset = u32::from_le_bytes([token[44], token[45], token[46], token[47]]) as usize;
        let target_info = token
            .get(info_offset..info_offset + info_len)
            .ok_or_else(|| AuthError::Ntlm("target info out of bounds".into()))?;

        Ok(Self {
            flags,
            server_challenge,
            target_info: Bytes::copy_from_slice(target_info),
        })
    }
}

/// User identity for the AUTHENTICATE message.
#[derive(Clone)]
pub struct NtlmCredentials<'a> {
    /// User name.
    pub username: &'a str,
    /// Password.
    pub password: &'a str,
    /// Domain.
    pub domain: &'a str,
    /// Client workstation name.
    pub workstation: &'a str,
}

/// Build the AUTHENTICATE message answering `challenge`.
pub fn authenticate(
    credentials: &NtlmCredentials<'_>,
    challenge: &Challenge,
) -> Result<Bytes, AuthError> {
    let client_challenge: [u8; 8] = rand::random();
    let since_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| AuthError::Ntlm(e.to_string()))?;
    let timestamp = (since_unix.as_secs() + FILETIME_EPOCH_OFFSET) * 10_000_000
        + u64::from(since_unix.subsec_nanos() / 100);
    authenticate_with(credentials, challenge, client_challenge, timestamp)
}

fn authenticate_with(
    credentials: &NtlmCredentials<'_>,
    challenge: &Challenge,
    client_challenge: [u8; 8],
    timestamp: u64,
) -> Result<Bytes, AuthError> {
    let key = ntowf_v2(credentials.password, credentials.username, credentials.domain)?;

    let mut blob = BytesMut::with_capacity(32 + challenge.target_info.len());
    blob.put_slice(&[0x01, 0x01, 0x00, 0x00]);
    blob.put_u32_le(0);
    blob.put_u64_le(timestamp);
    blob.put_slice(&client_challenge);
    blob.put_u32_le(0);
    blob.put_slice(&challenge.target_info);
    blob.put_u32_le(0);

    let nt_proof = hmac_md5(&key, &[&challenge.server_challenge[..], &blob[..]])?;
    let mut nt_response = Vec::with_capacity(16 + blob.len());
    nt_response.extend_from_slice(&nt_proof);
    nt_response.extend_from_slice(&blob);

    let lm_response = lm_v2_response(&key, &challenge.server_challenge, &client_challenge)?;

    let domain = utf16le(credentials.domain);
    let user = utf16le(credentials.username);
    let workstation = utf16le(credentials.workstation);

    let mut buf = BytesMut::with_capacity(
        AUTHENTICATE_HEADER_LEN
            + domain.len()
            + user.len()
            + workstation.len()
            + lm_response.len()
            + nt_response.len(),
    );
    buf.put_slice(SIGNATURE);
    buf.put_u32_le(AUTHENTICATE);

    // payload order: domain, user, workstation, LM, NT
    let domain_offset = AUTHENTICATE_HEADER_LEN;
    let user_offset = domain_offset + domain.len();
    let workstation_offset = user_offset + user.len();
    let lm_offset = workstation_offset + workstation.len();
    let nt_offset = lm_offset + lm_response.len();
    let end = nt_offset + nt_response.len();

    put_security_buffer(&mut buf, lm_response.len(), lm_offset);
    put_security_buffer(&mut buf, nt_response.len(), nt_offset);
    put_security_buffer(&mut buf, domain.len(), domain_offset);
    put_security_buffer(&mut buf, user.len(), user_offset);
    put_security_buffer(&mut buf, workstation.len(), workstation_offset);
    // no session key
    put_security_buffer(&mut buf, 0, end);
    buf.put_u32_le(challenge.flags);

    buf.put_slice(&domain);
    buf.put_slice(&user);
    buf.put_slice(&workstation);
    buf.put_slice(&lm_response);
    buf.put_slice(&nt_response);
    Ok(buf.freeze())
}

fn ntowf_v2(password: &str, username: &str, domain: &str) -> Result<[u8; 16], AuthError> {
    let nt_hash = Md4::digest(utf16le(password));
    let identity = utf16le(&format!("{}{}", username.to_uppercase(), domain));
    hmac_md5(&nt_hash, &[&identity[..]])
}

fn lm_v2_response(
    key: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
) -> Result<Vec<u8>, AuthError> {
    let proof = hmac_md5(key, &[&server_challenge[..], &client_challenge[..]])?;
    let mut response = Vec::with_capacity(24);
    response.extend_from_slice(&proof);
    response.extend_from_slice(client_challenge);
    Ok(response)
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 16], AuthError> {
    let mut mac = HmacMd5::new_from_slice(key).map_err(|e| AuthError::Ntlm(e.to_string()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

fn put_security_buffer(buf: &mut BytesMut, len: usize, offset: usize) {
    buf.put_u16_le(len as u16);
    buf.put_u16_le(len as u16);
    buf.put_u32_le(offset as u32);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn challenge_message(target_info: &[u8]) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(SIGNATURE);
        msg.extend_from_slice(&CHALLENGE.to_le_bytes());
        msg.extend_from_slice(&[0, 0, 0, 0, 48, 0, 0, 0]);
        msg.extend_from_slice(&0xE288_8215u32.to_le_bytes());
        msg.extend_from_slice(&hex("0123456789abcdef"));
        msg.extend_from_slice(&[0; 8]);
        msg.extend_from_slice(&(target_info.len() as u16).to_le_bytes());
        msg.extend_from_slice(&(target_info.len() as u16).to_le_bytes());
        msg.extend_from_slice(&48u32.to_le_bytes());
        msg.extend_from_slice(target_info);
        msg
    }

    #[test]
    fn test_negotiate_layout() {
        let msg = negotiate("CORP", "WS01");
        assert_eq!(&msg[..8], SIGNATURE);
        assert_eq!(u32::from_le_bytes(msg[8..12].try_into().unwrap()), NEGOTIATE);
        // domain buffer points right after the header
        assert_eq!(u16::from_le_bytes([msg[16], msg[17]]), 4);
        assert_eq!(u32::from_le_bytes(msg[20..24].try_into().unwrap()), 32);
        assert_eq!(&msg[32..36], b"CORP");
        assert_eq!(&msg[36..40], b"WS01");
    }

    #[test]
    fn test_challenge_parse() {
        let info = [0x02, 0x00, 0x02, 0x00, b'D', 0x00, 0x00, 0x00, 0x00, 0x00];
        let parsed = Challenge::parse(&challenge_message(&info)).unwrap();
        assert_eq!(parsed.server_challenge.to_vec(), hex("0123456789abcdef"));
        assert_eq!(parsed.flags, 0xE288_8215);
        assert_eq!(&parsed.target_info[..], &info);
    }

    #[test]
    fn test_challenge_rejects_wrong_type() {
        let mut msg = challenge_message(&[]);
        msg[8] = 1;
        assert!(Challenge::parse(&msg).is_err());
        assert!(Challenge::parse(&msg[..20]).is_err());
    }

    #[test]
    fn test_ntowf_v2_known_value() {
        let key = ntowf_v2("Password", "User", "Domain").unwrap();
        assert_eq!(key.to_vec(), hex("0c868a403bfd7a93a3001ef22ef02e3f"));
    }

    #[test]
    fn test_lm_v2_known_value() {
        let key = ntowf_v2("Password", "User", "Domain").unwrap();
        let server: [u8; 8] = hex("0123456789abcdef").try_into().unwrap();
        let response = lm_v2_response(&key, &server, &[0xaa; 8]).unwrap();
        assert_eq!(
            response,
            hex("86c35097ac9cec102554764a57cccc19aaaaaaaaaaaaaaaa")
        );
    }

    #[test]
    fn test_authenticate_layout() {
        let challenge = Challenge::parse(&challenge_message(&[0, 0, 0, 0])).unwrap();
        let creds = NtlmCredentials {
            username: "bob",
            password: "pw",
            domain: "CORP",
            workstation: "WS",
        };
        let msg = authenticate_with(&creds, &challenge, [0x11; 8], 0).unwrap();
        assert_eq!(
            u32::from_le_bytes(msg[8..12].try_into().unwrap()),
            AUTHENTICATE
        );

        // user name security buffer
        let user_len = u16::from_le_bytes([msg[36], msg[37]]) as usize;
        let user_off = u32::from_le_bytes(msg[40..44].try_into().unwrap()) as usize;
        assert_eq!(&msg[user_off..user_off + user_len], &utf16le("bob")[..]);

        // NT response is proof (16) + blob (28 + target info 4)
        let nt_len = u16::from_le_bytes([msg[20], msg[21]]) as usize;
        assert_eq!(nt_len, 16 + 28 + 4 + 4);
        let nt_off = u32::from_le_bytes(msg[24..28].try_into().unwrap()) as usize;
        assert_eq!(nt_off + nt_len, msg.len());
        assert_eq!(&msg[nt_off + 16..nt_off + 20], &[1, 1, 0, 0]);
    }
}
