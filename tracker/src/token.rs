use std::error::Error;
use std::fmt::Display;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const MAX_TOKEN_LENGTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Anonymous, per-browser
    Device,
    /// Derived from a hashed external user id
    User,
}

impl TokenKind {
    fn prefix(&self) -> &'static str {
        match self {
            TokenKind::Device => "d",
            TokenKind::User => "u",
        }
    }

    fn from_prefix(prefix: &str) -> Option<TokenKind> {
        match prefix {
            "d" => Some(TokenKind::Device),
            "u" => Some(TokenKind::User),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum InvalidTokenReason {
    IsEmpty,
    IsTooLong,
    IsNotAscii,
    Malformed,
    WrongKind,
    BadSignature,
}

impl InvalidTokenReason {
    pub fn reason(&self) -> &str {
        match *self {
            Self::IsEmpty => "empty",
            Self::IsTooLong => "too_long",
            Self::IsNotAscii => "not_ascii",
            Self::Malformed => "malformed",
            Self::WrongKind => "wrong_kind",
            Self::BadSignature => "bad_signature",
        }
    }
}

impl Display for InvalidTokenReason {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.reason())
    }
}

impl Error for InvalidTokenReason {}

/// Mints and checks identity tokens of the form `<kind>.<payload>.<signature>`,
/// both halves base64url encoded and signed with HMAC-SHA256.
#[derive(Clone)]
pub struct TokenGenerator {
    mac: HmacSha256,
}

impl TokenGenerator {
    pub fn new(secret: &str) -> Result<Self, InvalidLength> {
        let mac = HmacSha256::new_from_slice(secret.as_bytes())?;
        Ok(TokenGenerator { mac })
    }

    fn sign(&self, message: &str) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(message.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    fn issue(&self, kind: TokenKind, payload: &str) -> String {
        let body = format!("{}.{}", kind.prefix(), URL_SAFE_NO_PAD.encode(payload));
        let signature = URL_SAFE_NO_PAD.encode(self.sign(&body));
        format!("{body}.{signature}")
    }

    /// Anonymous device token. The nonce keeps tokens minted within the same
    /// millisecond apart.
    pub fn generate_token(&self, timestamp_ms: i64, nonce: Uuid) -> String {
        self.issue(
            TokenKind::Device,
            &format!("{}:{}", timestamp_ms, nonce.simple()),
        )
    }

    /// Keyed digest of an external user id, so raw ids never reach storage.
    pub fn hash_user_id(&self, uid: &str) -> String {
        hex::encode(self.sign(&format!("uid:{uid}")))
    }

    pub fn generate_hash_token(&self, hashed_user_id: &str) -> String {
        self.issue(TokenKind::User, hashed_user_id)
    }

    /// Checks shape and signature, returning the decoded payload.
    pub fn verify(&self, token: &str, kind: TokenKind) -> Result<String, InvalidTokenReason> {
        if token.is_empty() {
            return Err(InvalidTokenReason::IsEmpty);
        }

        if token.len() > MAX_TOKEN_LENGTH {
            return Err(InvalidTokenReason::IsTooLong);
        }

        if !token.is_ascii() {
            return Err(InvalidTokenReason::IsNotAscii);
        }

        let (body, signature) = token
            .rsplit_once('.')
            .ok_or(InvalidTokenReason::Malformed)?;
        let (prefix, payload) = body.split_once('.').ok_or(InvalidTokenReason::Malformed)?;

        match TokenKind::from_prefix(prefix) {
            Some(found) if found == kind => {}
            Some(_) => return Err(InvalidTokenReason::WrongKind),
            None => return Err(InvalidTokenReason::Malformed),
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| InvalidTokenReason::Malformed)?;

        let mut mac = self.mac.clone();
        mac.update(body.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| InvalidTokenReason::BadSignature)?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| InvalidTokenReason::Malformed)?;
        String::from_utf8(payload).map_err(|_| InvalidTokenReason::Malformed)
    }
}
