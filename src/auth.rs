use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::OnceLock;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_ALG: &str = "HS256";
const MAX_TOKEN_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Student,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Student => "student",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "teacher" => Some(Role::Teacher),
            "student" => Some(Role::Student),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token payload. `id` is `users.id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub id: i64,
    pub email: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenHeader {
    alg: String,
    typ: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenErrorCode {
    Malformed,
    UnsupportedAlgorithm,
    InvalidSignature,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenError {
    pub code: TokenErrorCode,
    pub message: String,
}

impl TokenError {
    fn new(code: TokenErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for TokenError {}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("failed to hash password: {e}"))?;
    Ok(hash.to_string())
}

/// Unparseable stored hashes verify as false.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Burns one Argon2 verification against a fixed hash, so a login for an
/// unknown email costs as much as one with a wrong password.
pub fn verify_dummy_password(password: &str) {
    static DUMMY_HASH: OnceLock<Option<String>> = OnceLock::new();
    if let Some(hash) = DUMMY_HASH.get_or_init(|| hash_password("sims-unknown-account").ok()) {
        verify_password(password, hash);
    }
}

pub fn issue_token(
    user_id: i64,
    email: &str,
    role: Role,
    secret: &[u8],
    ttl: Duration,
) -> Result<(String, Claims), TokenError> {
    let now = chrono::Utc::now().timestamp();
    let exp = i64::try_from(ttl.as_secs())
        .ok()
        .and_then(|secs| now.checked_add(secs))
        .ok_or_else(|| TokenError::new(TokenErrorCode::Malformed, "token lifetime out of range"))?;
    let claims = Claims {
        id: user_id,
        email: email.to_string(),
        role,
        iat: now,
        exp,
    };
    let token = encode_token(&claims, secret)?;
    Ok((token, claims))
}

pub fn encode_token(claims: &Claims, secret: &[u8]) -> Result<String, TokenError> {
    let header = TokenHeader {
        alg: TOKEN_ALG.to_string(),
        typ: "JWT".to_string(),
    };
    let header_json = serde_json::to_vec(&header)
        .map_err(|e| TokenError::new(TokenErrorCode::Malformed, e.to_string()))?;
    let claims_json = serde_json::to_vec(claims)
        .map_err(|e| TokenError::new(TokenErrorCode::Malformed, e.to_string()))?;
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header_json),
        URL_SAFE_NO_PAD.encode(claims_json)
    );
    let sig = sign(signing_input.as_bytes(), secret)?;
    Ok(format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(sig)))
}

pub fn verify_token(token: &str, secret: &[u8]) -> Result<Claims, TokenError> {
    verify_token_at(token, secret, chrono::Utc::now().timestamp())
}

pub fn verify_token_at(token: &str, secret: &[u8], now: i64) -> Result<Claims, TokenError> {
    if token.is_empty() || token.len() > MAX_TOKEN_LEN {
        return Err(TokenError::new(
            TokenErrorCode::Malformed,
            "token length out of range",
        ));
    }
    let mut parts = token.split('.');
    let (Some(header_part), Some(claims_part), Some(sig_part), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(TokenError::new(
            TokenErrorCode::Malformed,
            "token must have three parts",
        ));
    };

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_part)
        .map_err(|e| TokenError::new(TokenErrorCode::Malformed, e.to_string()))?;
    let header: TokenHeader = serde_json::from_slice(&header_bytes)
        .map_err(|e| TokenError::new(TokenErrorCode::Malformed, e.to_string()))?;
    if header.alg != TOKEN_ALG {
        return Err(TokenError::new(
            TokenErrorCode::UnsupportedAlgorithm,
            format!("unsupported token algorithm: {}", header.alg),
        ));
    }

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| TokenError::new(TokenErrorCode::Malformed, e.to_string()))?;
    mac.update(header_part.as_bytes());
    mac.update(b".");
    mac.update(claims_part.as_bytes());
    let sig = URL_SAFE_NO_PAD
        .decode(sig_part)
        .map_err(|e| TokenError::new(TokenErrorCode::Malformed, e.to_string()))?;
    mac.verify_slice(&sig).map_err(|_| {
        TokenError::new(TokenErrorCode::InvalidSignature, "token signature mismatch")
    })?;

    let claims_bytes = URL_SAFE_NO_PAD
        .decode(claims_part)
        .map_err(|e| TokenError::new(TokenErrorCode::Malformed, e.to_string()))?;
    let claims: Claims = serde_json::from_slice(&claims_bytes)
        .map_err(|e| TokenError::new(TokenErrorCode::Malformed, e.to_string()))?;
    if claims.exp <= now {
        return Err(TokenError::new(TokenErrorCode::Expired, "token expired"));
    }
    Ok(claims)
}

fn sign(input: &[u8], secret: &[u8]) -> Result<Vec<u8>, TokenError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| TokenError::new(TokenErrorCode::Malformed, e.to_string()))?;
    mac.update(input);
    Ok(mac.finalize().into_bytes().to_vec())
}
