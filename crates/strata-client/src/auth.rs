//! SCRAM-SHA-256 client side (RFC 5802, RFC 7677), without channel binding.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac_array;
use rand::RngCore;
use sha2::{Digest, Sha256};
use strata_core::StrataError;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

const NONCE_LEN: usize = 18;
/// Upper bound on the server-chosen PBKDF2 work factor.
pub const MAX_ITERATIONS: u32 = 1_000_000;
/// "n,," base64-encoded: no channel binding.
const GS2_HEADER_B64: &str = "biws";

type HmacSha256 = Hmac<Sha256>;

fn auth_error(msg: impl Into<String>) -> StrataError {
    StrataError::Authentication(msg.into())
}

pub(crate) fn hmac(key: &[u8], data: &[u8]) -> Result<[u8; 32], StrataError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|err| auth_error(err.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

pub(crate) fn salted_password(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    pbkdf2_hmac_array::<Sha256, 32>(password, salt, iterations)
}

pub(crate) struct ScramKeys {
    pub stored_key: [u8; 32],
    pub client_key: [u8; 32],
    pub server_key: [u8; 32],
}

pub(crate) fn derive_keys(salted: &[u8; 32]) -> Result<ScramKeys, StrataError> {
    let client_key = hmac(salted, b"Client Key")?;
    let server_key = hmac(salted, b"Server Key")?;
    let stored_key: [u8; 32] = Sha256::digest(client_key).into();
    Ok(ScramKeys {
        stored_key,
        client_key,
        server_key,
    })
}

fn escape_username(user: &str) -> String {
    user.replace('=', "=3D").replace(',', "=2C")
}

#[derive(Debug)]
enum Phase {
    Initial,
    FirstSent,
    FinalSent {
        server_key: [u8; 32],
        auth_message: String,
    },
    Done,
}

/// Drives one SCRAM exchange. Each step must be called once, in order.
#[derive(Debug)]
pub struct ScramClient {
    password: String,
    client_nonce: String,
    client_first_bare: String,
    phase: Phase,
}

impl ScramClient {
    pub fn new(user: &str, password: &str) -> Self {
        let mut raw = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut raw);
        Self::with_nonce(user, password, &STANDARD.encode(raw))
    }

    pub fn with_nonce(user: &str, password: &str, nonce: &str) -> Self {
        Self {
            password: password.to_string(),
            client_nonce: nonce.to_string(),
            client_first_bare: format!("n={},r={}", escape_username(user), nonce),
            phase: Phase::Initial,
        }
    }

    pub fn client_first(&mut self) -> Result<String, StrataError> {
        if !matches!(self.phase, Phase::Initial) {
            return Err(auth_error("client-first message already sent"));
        }
        self.phase = Phase::FirstSent;
        Ok(format!("n,,{}", self.client_first_bare))
    }

    /// Consumes server-first and returns client-final.
    pub fn handle_server_first(&mut self, server_first: &[u8]) -> Result<String, StrataError> {
        if !matches!(self.phase, Phase::FirstSent) {
            return Err(auth_error("unexpected server-first message"));
        }
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| auth_error("server-first message is not UTF-8"))?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attr in server_first.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) => nonce = Some(v),
                Some(("s", v)) => salt = Some(v),
                Some(("i", v)) => iterations = Some(v),
                Some(("m", _)) => return Err(auth_error("mandatory SCRAM extension not supported")),
                _ => return Err(auth_error(format!("malformed server-first attribute {attr:?}"))),
            }
        }
        let nonce = nonce.ok_or_else(|| auth_error("server-first without nonce"))?;
        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(auth_error("server nonce does not extend the client nonce"));
        }
        let salt = STANDARD
            .decode(salt.ok_or_else(|| auth_error("server-first without salt"))?)
            .map_err(|_| auth_error("salt is not valid base64"))?;
        let iterations: u32 = iterations
            .ok_or_else(|| auth_error("server-first without iteration count"))?
            .parse()
            .map_err(|_| auth_error("invalid iteration count"))?;
        if iterations == 0 {
            return Err(auth_error("iteration count must be at least 1"));
        }
        if iterations > MAX_ITERATIONS {
            return Err(auth_error(format!(
                "iteration count {iterations} exceeds {MAX_ITERATIONS}"
            )));
        }

        let salted = salted_password(self.password.as_bytes(), &salt, iterations);
        let keys = derive_keys(&salted)?;
        let without_proof = format!("c={GS2_HEADER_B64},r={nonce}");
        let auth_message = format!("{},{},{}", self.client_first_bare, server_first, without_proof);
        let client_signature = hmac(&keys.stored_key, auth_message.as_bytes())?;
        let mut proof = keys.client_key;
        for (p, s) in proof.iter_mut().zip(client_signature.iter()) {
            *p ^= s;
        }
        self.phase = Phase::FinalSent {
            server_key: keys.server_key,
            auth_message,
        };
        Ok(format!("{without_proof},p={}", STANDARD.encode(proof)))
    }

    pub fn verify_server_final(&mut self, server_final: &[u8]) -> Result<(), StrataError> {
        let Phase::FinalSent {
            server_key,
            auth_message,
        } = &self.phase
        else {
            return Err(auth_error("unexpected server-final message"));
        };
        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| auth_error("server-final message is not UTF-8"))?;
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(auth_error(format!("server rejected authentication: {err}")));
        }
        let verifier = server_final
            .split(',')
            .find_map(|attr| attr.strip_prefix("v="))
            .ok_or_else(|| auth_error("server-final without verifier"))?;
        let verifier = STANDARD
            .decode(verifier)
            .map_err(|_| auth_error("server verifier is not valid base64"))?;
        let mut mac =
            HmacSha256::new_from_slice(server_key).map_err(|err| auth_error(err.to_string()))?;
        mac.update(auth_message.as_bytes());
        mac.verify_slice(&verifier)
            .map_err(|_| auth_error("server signature mismatch"))?;
        self.phase = Phase::Done;
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Done)
    }
}
