//! NTLMv2 messages for HTTP `Negotiate`/`NTLM` authentication.
//!
//! Only what WinRM needs: the negotiate message, parsing the server's
//! challenge, and the authenticate message. No session security is
//! established, so payloads travel unsealed (use TLS, or allow unencrypted
//! traffic on the listener).

use std::time::{SystemTime, UNIX_EPOCH};

use md4::Md4;
use md5::{Digest, Md5};
use thiserror::Error;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;
const NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;
const NEGOTIATE_128: u32 = 0x2000_0000;
const NEGOTIATE_56: u32 = 0x8000_0000;

const CLIENT_FLAGS: u32 = NEGOTIATE_UNICODE
    | REQUEST_TARGET
    | NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | NEGOTIATE_EXTENDED_SESSIONSECURITY
    | NEGOTIATE_TARGET_INFO
    | NEGOTIATE_128
    | NEGOTIATE_56;

const AV_EOL: u16 = 0;
const AV_TIMESTAMP: u16 = 7;

/// 100ns intervals between 1601-01-01 and 1970-01-01
const FILETIME_UNIX_OFFSET: u64 = 116_444_736_000_000_000;

const AUTHENTICATE_HEADER_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NtlmError {
    #[error("challenge message is truncated")]
    Truncated,
    #[error("challenge message has an invalid signature")]
    BadSignature,
    #[error("unexpected NTLM message type {0}")]
    UnexpectedType(u32),
    #[error("target info points outside the challenge message")]
    TargetInfoOutOfBounds,
}

/// Type 2 message sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub flags: u32,
    pub server_challenge: [u8; 8],
    pub target_info: Vec<u8>,
}

impl Challenge {
    pub fn parse(message: &[u8]) -> Result<Self, NtlmError> {
        if message.len() < 32 {
            return Err(NtlmError::Truncated);
        }
        if &message[..8] != SIGNATURE {
            return Err(NtlmError::BadSignature);
        }

        let message_type = read_u32(message, 8);
        if message_type != 2 {
            return Err(NtlmError::UnexpectedType(message_type));
        }

        let flags = read_u32(message, 20);
        let mut server_challenge = [0u8; 8];
        server_challenge.copy_from_slice(&message[24..32]);

        // Target info fields follow the 8 reserved bytes; older servers omit them.
        let target_info = if message.len() >= 48 {
            let len = usize::from(read_u16(message, 40));
            let offset = read_u32(message, 44) as usize;
            message
                .get(offset..offset + len)
                .ok_or(NtlmError::TargetInfoOutOfBounds)?
                .to_vec()
        } else {
            Vec::new()
        };

        Ok(Self {
            flags,
            server_challenge,
            target_info,
        })
    }

    /// `MsvAvTimestamp` from the target info, if the server sent one.
    fn timestamp(&self) -> Option<u64> {
        let mut pairs = self.target_info.as_slice();
        while pairs.len() >= 4 {
            let id = u16::from_le_bytes([pairs[0], pairs[1]]);
            let len = usize::from(u16::from_le_bytes([pairs[2], pairs[3]]));
            let value = pairs.get(4..4 + len)?;
            match id {
                AV_EOL => return None,
                AV_TIMESTAMP if len == 8 => {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(value);
                    return Some(u64::from_le_bytes(raw));
                }
                _ => pairs = &pairs[4 + len..],
            }
        }
        None
    }
}

/// Account used for NTLM; `DOMAIN\user` carries the domain.
#[derive(Clone)]
pub struct NtlmCredentials {
    domain: String,
    user: String,
    password: String,
}

impl NtlmCredentials {
    pub fn new(user: &str, password: &str) -> Self {
        let (domain, user) = match user.split_once('\\') {
            Some((domain, user)) => (domain.to_string(), user.to_string()),
            None => (String::new(), user.to_string()),
        };

        Self {
            domain,
            user,
            password: password.to_string(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Type 1 message with empty domain and workstation fields.
    pub fn negotiate_message(&self) -> Vec<u8> {
        let mut message = Vec::with_capacity(32);
        message.extend_from_slice(SIGNATURE);
        message.extend_from_slice(&1u32.to_le_bytes());
        message.extend_from_slice(&CLIENT_FLAGS.to_le_bytes());
        push_security_buffer(&mut message, 0, 32);
        push_security_buffer(&mut message, 0, 32);
        message
    }

    /// Type 3 message answering `challenge`.
    pub fn authenticate_message(&self, challenge: &Challenge) -> Vec<u8> {
        let client_challenge: [u8; 8] = rand::random();
        let timestamp = challenge.timestamp().unwrap_or_else(filetime_now);
        self.authenticate_with(challenge, client_challenge, timestamp)
    }

    fn authenticate_with(
        &self,
        challenge: &Challenge,
        client_challenge: [u8; 8],
        timestamp: u64,
    ) -> Vec<u8> {
        let key = ntowf_v2(&self.user, &self.domain, &self.password);

        let blob = client_blob(client_challenge, timestamp, &challenge.target_info);
        let nt_proof = hmac_md5(&key, &[&challenge.server_challenge[..], &blob].concat());
        let nt_response = [&nt_proof[..], &blob].concat();

        let lm_proof = hmac_md5(
            &key,
            &[&challenge.server_challenge[..], &client_challenge].concat(),
        );
        let lm_response = [&lm_proof[..], &client_challenge].concat();

        let domain = utf16le(&self.domain);
        let user = utf16le(&self.user);
        let workstation: Vec<u8> = Vec::new();

        let mut offset = AUTHENTICATE_HEADER_LEN;
        let mut message = Vec::with_capacity(
            AUTHENTICATE_HEADER_LEN
                + lm_response.len()
                + nt_response.len()
                + domain.len()
                + user.len(),
        );
        message.extend_from_slice(SIGNATURE);
        message.extend_from_slice(&3u32.to_le_bytes());

        for payload in [&lm_response, &nt_response, &domain, &user, &workstation] {
            push_security_buffer(&mut message, payload.len(), offset);
            offset += payload.len();
        }
        // no session key
        push_security_buffer(&mut message, 0, offset);

        let flags = CLIENT_FLAGS & (challenge.flags | NEGOTIATE_UNICODE | NEGOTIATE_NTLM);
        message.extend_from_slice(&flags.to_le_bytes());

        debug_assert_eq!(message.len(), AUTHENTICATE_HEADER_LEN);
        for payload in [&lm_response, &nt_response, &domain, &user, &workstation] {
            message.extend_from_slice(payload);
        }

        message
    }
}

fn client_blob(client_challenge: [u8; 8], timestamp: u64, target_info: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(32 + target_info.len());
    blob.extend_from_slice(&[0x01, 0x01, 0, 0, 0, 0, 0, 0]);
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(&client_challenge);
    blob.extend_from_slice(&[0u8; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0u8; 4]);
    blob
}

fn push_security_buffer(message: &mut Vec<u8>, len: usize, offset: usize) {
    let len = len as u16;
    message.extend_from_slice(&len.to_le_bytes());
    message.extend_from_slice(&len.to_le_bytes());
    message.extend_from_slice(&(offset as u32).to_le_bytes());
}

fn nt_hash(password: &str) -> [u8; 16] {
    Md4::digest(utf16le(password)).into()
}

fn ntowf_v2(user: &str, domain: &str, password: &str) -> [u8; 16] {
    let identity = format!("{}{}", user.to_uppercase(), domain);
    hmac_md5(&nt_hash(password), &utf16le(&identity))
}

fn hmac_md5(key: &[u8], data: &[u8]) -> [u8; 16] {
    const BLOCK: usize = 64;

    let mut key_block = [0u8; BLOCK];
    if key.len() > BLOCK {
        key_block[..16].copy_from_slice(&Md5::digest(key));
    } else {
        key_block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Md5::new();
    inner.update(key_block.map(|b| b ^ 0x36));
    inner.update(data);
    let inner = inner.finalize();

    let mut outer = Md5::new();
    outer.update(key_block.map(|b| b ^ 0x5c));
    outer.update(inner);
    outer.finalize().into()
}

fn utf16le(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn filetime_now() -> u64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    FILETIME_UNIX_OFFSET + (since_epoch.as_nanos() / 100) as u64
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    // MS-NLMP 4.2.4 sample values
    const SERVER_CHALLENGE: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef];
    const CLIENT_CHALLENGE: [u8; 8] = [0xaa; 8];

    fn sample_target_info() -> Vec<u8> {
        let mut info = Vec::new();
        info.extend_from_slice(&2u16.to_le_bytes());
        info.extend_from_slice(&12u16.to_le_bytes());
        info.extend_from_slice(&utf16le("Domain"));
        info.extend_from_slice(&1u16.to_le_bytes());
        info.extend_from_slice(&12u16.to_le_bytes());
        info.extend_from_slice(&utf16le("Server"));
        info.extend_from_slice(&[0, 0, 0, 0]);
        info
    }

    fn challenge_message(target_info: &[u8]) -> Vec<u8> {
        let mut message = Vec::new();
        message.extend_from_slice(SIGNATURE);
        message.extend_from_slice(&2u32.to_le_bytes());
        push_security_buffer(&mut message, 0, 48);
        message.extend_from_slice(&CLIENT_FLAGS.to_le_bytes());
        message.extend_from_slice(&SERVER_CHALLENGE);
        message.extend_from_slice(&[0u8; 8]);
        push_security_buffer(&mut message, target_info.len(), 48);
        message.extend_from_slice(target_info);
        message
    }

    #[test]
    fn nt_hash_of_password() {
        assert_eq!(
            nt_hash("Password"),
            [
                0xa4, 0xf4, 0x9c, 0x40, 0x65, 0x10, 0xbd, 0xca, 0xb6, 0x82, 0x4e, 0xe7, 0xc3,
                0x0f, 0xd8, 0x52
            ]
        );
    }

    #[test]
    fn ntowf_v2_matches_reference() {
        assert_eq!(
            ntowf_v2("User", "Domain", "Password"),
            [
                0x0c, 0x86, 0x8a, 0x40, 0x3b, 0xfd, 0x7a, 0x93, 0xa3, 0x00, 0x1e, 0xf2, 0x2e,
                0xf0, 0x2e, 0x3f
            ]
        );
    }

    #[test]
    fn nt_proof_matches_reference() {
        let key = ntowf_v2("User", "Domain", "Password");
        let blob = client_blob(CLIENT_CHALLENGE, 0, &sample_target_info());
        let proof = hmac_md5(&key, &[&SERVER_CHALLENGE[..], &blob].concat());

        assert_eq!(
            proof,
            [
                0x68, 0xcd, 0x0a, 0xb8, 0x51, 0xe5, 0x1c, 0x96, 0xaa, 0xbc, 0x92, 0x7b, 0xeb,
                0xef, 0x6a, 0x1c
            ]
        );
    }

    #[test]
    fn negotiate_message_layout() {
        let message = NtlmCredentials::new("administrator", "secret").negotiate_message();

        assert_eq!(message.len(), 32);
        assert_eq!(&message[..8], b"NTLMSSP\0");
        assert_eq!(read_u32(&message, 8), 1);
        assert_eq!(read_u32(&message, 12), CLIENT_FLAGS);
    }

    #[test]
    fn challenge_parsing() {
        let info = sample_target_info();
        let challenge = Challenge::parse(&challenge_message(&info)).unwrap();

        assert_eq!(challenge.server_challenge, SERVER_CHALLENGE);
        assert_eq!(challenge.target_info, info);
        assert_eq!(challenge.timestamp(), None);
    }

    #[test]
    fn challenge_rejects_garbage() {
        assert_eq!(Challenge::parse(b"short"), Err(NtlmError::Truncated));
        assert_eq!(Challenge::parse(&[0u8; 48]), Err(NtlmError::BadSignature));

        let mut negotiate = NtlmCredentials::new("u", "p").negotiate_message();
        negotiate.extend_from_slice(&[0u8; 16]);
        assert_eq!(Challenge::parse(&negotiate), Err(NtlmError::UnexpectedType(1)));

        let mut broken = challenge_message(&sample_target_info());
        broken.truncate(60);
        assert_eq!(Challenge::parse(&broken), Err(NtlmError::TargetInfoOutOfBounds));
    }

    #[test]
    fn timestamp_is_taken_from_target_info() {
        let mut info = Vec::new();
        info.extend_from_slice(&AV_TIMESTAMP.to_le_bytes());
        info.extend_from_slice(&8u16.to_le_bytes());
        info.extend_from_slice(&42u64.to_le_bytes());
        info.extend_from_slice(&[0, 0, 0, 0]);

        let challenge = Challenge::parse(&challenge_message(&info)).unwrap();
        assert_eq!(challenge.timestamp(), Some(42));
    }

    #[test]
    fn domain_is_split_from_user() {
        let creds = NtlmCredentials::new("CORP\\icinga", "secret");
        assert_eq!(creds.domain(), "CORP");
        assert_eq!(creds.user(), "icinga");

        let upn = NtlmCredentials::new("icinga@corp.example", "secret");
        assert_eq!(upn.domain(), "");
        assert_eq!(upn.user(), "icinga@corp.example");
    }

    #[test]
    fn authenticate_message_layout() {
        let creds = NtlmCredentials::new("Domain\\User", "Password");
        let challenge = Challenge::parse(&challenge_message(&sample_target_info())).unwrap();
        let message = creds.authenticate_with(&challenge, CLIENT_CHALLENGE, 0);

        assert_eq!(&message[..8], b"NTLMSSP\0");
        assert_eq!(read_u32(&message, 8), 3);

        let field = |at: usize| {
            let len = usize::from(read_u16(&message, at));
            let offset = read_u32(&message, at + 4) as usize;
            message[offset..offset + len].to_vec()
        };

        assert_eq!(field(12).len(), 24);
        assert_eq!(&field(12)[16..], &CLIENT_CHALLENGE);

        let nt_response = field(20);
        assert_eq!(
            &nt_response[..16],
            &[
                0x68, 0xcd, 0x0a, 0xb8, 0x51, 0xe5, 0x1c, 0x96, 0xaa, 0xbc, 0x92, 0x7b, 0xeb,
                0xef, 0x6a, 0x1c
            ]
        );
        assert_eq!(field(28), utf16le("Domain"));
        assert_eq!(field(36), utf16le("User"));
        assert!(field(44).is_empty());
        assert_eq!(message.len(), 64 + 24 + nt_response.len() + 12 + 8);
    }
}
