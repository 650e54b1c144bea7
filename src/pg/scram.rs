//! SCRAM-SHA-256 authentication (RFC 5802, RFC 7677).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// SCRAM failure, carrying a short reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScramError(pub &'static str);

impl std::fmt::Display for ScramError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SCRAM: {}", self.0)
    }
}

impl std::error::Error for ScramError {}

/// Client side of one SCRAM-SHA-256 exchange.
pub struct ScramClient {
    password: String,
    client_first_bare: String,
    client_nonce: String,
    /// Set after the server-first message: (salted password, auth message)
    verifier: Option<([u8; 32], String)>,
}

impl ScramClient {
    pub fn new(username: &str, password: &str) -> Self {
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(username, password, &BASE64.encode(nonce_bytes))
    }

    /// Build a client with a fixed nonce.
    pub fn with_nonce(username: &str, password: &str, nonce: &str) -> Self {
        Self {
            password: password.to_string(),
            client_first_bare: format!("n={},r={}", username, nonce),
            client_nonce: nonce.to_string(),
            verifier: None,
        }
    }

    /// `n,,n=<user>,r=<client-nonce>` (no channel binding).
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare).into_bytes()
    }

    /// Consume `r=<nonce>,s=<salt>,i=<iterations>` and produce the
    /// client-final message with the proof.
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, ScramError> {
        let server_first =
            std::str::from_utf8(server_msg).map_err(|_| ScramError("server message is not UTF-8"))?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(v) = part.strip_prefix("r=") {
                nonce = Some(v);
            } else if let Some(v) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(v).map_err(|_| ScramError("invalid salt encoding"))?);
            } else if let Some(v) = part.strip_prefix("i=") {
                iterations = Some(v.parse::<u32>().map_err(|_| ScramError("invalid iteration count"))?);
            }
        }
        let nonce = nonce.ok_or(ScramError("missing nonce"))?;
        let salt = salt.ok_or(ScramError("missing salt"))?;
        let iterations = iterations.ok_or(ScramError("missing iteration count"))?;

        if !nonce.starts_with(&self.client_nonce) {
            return Err(ScramError("server nonce does not extend client nonce"));
        }

        let mut salted_password = [0u8; 32];
        pbkdf2::pbkdf2::<HmacSha256>(self.password.as_bytes(), &salt, iterations, &mut salted_password)
            .map_err(|_| ScramError("key derivation failed"))?;

        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let client_final_without_proof = format!("c=biws,r={}", nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, client_final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(client_signature) {
            *p ^= s;
        }

        self.verifier = Some((salted_password, auth_message));
        Ok(format!("{},p={}", client_final_without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check the server signature in `v=<verifier>`.
    pub fn verify_server_final(&self, server_msg: &[u8]) -> Result<(), ScramError> {
        let (salted_password, auth_message) =
            self.verifier.as_ref().ok_or(ScramError("server-final before server-first"))?;

        let verifier = std::str::from_utf8(server_msg)
            .ok()
            .and_then(|s| s.strip_prefix("v="))
            .ok_or(ScramError("malformed server signature"))?;
        let signature = BASE64
            .decode(verifier)
            .map_err(|_| ScramError("malformed server signature"))?;

        let server_key = hmac_sha256(salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, auth_message.as_bytes())?;
        if signature != expected {
            return Err(ScramError("server signature mismatch"));
        }
        Ok(())
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError("invalid HMAC key"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}
