//! Password and SASL responses.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::protocol::codec::MessageBuilder;

type HmacSha256 = Hmac<Sha256>;

/// PasswordMessage (cleartext or MD5-hashed).
pub fn write_password(buf: &mut Vec<u8>, password: &str) -> Result<()> {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_cstr(password);
    msg.finish()
}

/// `"md5" + md5(md5(password + user) + salt)`, hex encoded.
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    use md5::Md5;

    let inner = Md5::new()
        .chain_update(password.as_bytes())
        .chain_update(user.as_bytes())
        .finalize();
    let outer = Md5::new()
        .chain_update(format!("{inner:x}").as_bytes())
        .chain_update(salt)
        .finalize();
    format!("md5{outer:x}")
}

pub fn write_sasl_initial_response(buf: &mut Vec<u8>, mechanism: &str, data: &[u8]) -> Result<()> {
    let len = i32::try_from(data.len())
        .map_err(|_| Error::Auth("SASL response too large".into()))?;
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_cstr(mechanism);
    msg.write_i32(len);
    msg.write_bytes(data);
    msg.finish()
}

pub fn write_sasl_response(buf: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_bytes(data);
    msg.finish()
}

/// Client side of SCRAM-SHA-256 without channel binding.
pub struct ScramClient {
    nonce: String,
    password: String,
    auth_message: Option<String>,
    salted_password: Option<[u8; 32]>,
}

const GS2_HEADER: &str = "n,,";

impl ScramClient {
    pub fn new(password: &str) -> Self {
        use rand::Rng;

        let mut nonce = [0u8; 18];
        rand::rng().fill(&mut nonce);
        Self {
            nonce: BASE64.encode(nonce),
            password: password.to_string(),
            auth_message: None,
            salted_password: None,
        }
    }

    fn client_first_bare(&self) -> String {
        // the server takes the user name from the startup message
        format!("n=,r={}", self.nonce)
    }

    pub fn client_first_message(&self) -> String {
        format!("{GS2_HEADER}{}", self.client_first_bare())
    }

    /// Consume server-first-message and produce client-final-message.
    pub fn process_server_first(&mut self, server_first: &str) -> Result<String> {
        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            match part.split_once('=') {
                Some(("r", v)) => nonce = Some(v),
                Some(("s", v)) => salt = Some(v),
                Some(("i", v)) => iterations = v.parse::<u32>().ok(),
                _ => {}
            }
        }
        let missing = |what: &str| Error::Auth(format!("server-first-message lacks {what}"));
        let nonce = nonce.ok_or_else(|| missing("nonce"))?;
        let salt = salt.ok_or_else(|| missing("salt"))?;
        let iterations = iterations.ok_or_else(|| missing("iteration count"))?;

        if !nonce.starts_with(&self.nonce) {
            return Err(Error::Auth("server nonce does not extend client nonce".into()));
        }
        let salt = BASE64
            .decode(salt)
            .map_err(|e| Error::Auth(format!("invalid SCRAM salt: {e}")))?;

        let mut salted = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(self.password.as_bytes(), &salt, iterations, &mut salted);

        let client_key = hmac(&salted, b"Client Key")?;
        let stored_key = Sha256::digest(client_key);

        let without_proof = format!("c={},r={nonce}", BASE64.encode(GS2_HEADER));
        let auth_message = format!(
            "{},{server_first},{without_proof}",
            self.client_first_bare()
        );
        let signature = hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        self.salted_password = Some(salted);
        self.auth_message = Some(auth_message);
        Ok(format!("{without_proof},p={}", BASE64.encode(proof)))
    }

    /// Check the server signature in server-final-message.
    pub fn verify_server_final(&self, server_final: &str) -> Result<()> {
        let signature = server_final.strip_prefix("v=").ok_or_else(|| {
            Error::Auth(format!("unexpected server-final-message: {server_final}"))
        })?;
        let signature = BASE64
            .decode(signature)
            .map_err(|e| Error::Auth(format!("invalid server signature: {e}")))?;

        let (Some(salted), Some(auth_message)) = (&self.salted_password, &self.auth_message) else {
            return Err(Error::Auth("server-final-message before server-first-message".into()));
        };
        let server_key = hmac(salted, b"Server Key")?;
        let expected = hmac(&server_key, auth_message.as_bytes())?;
        if signature.as_slice() != expected.as_slice() {
            return Err(Error::Auth("server signature mismatch".into()));
        }
        Ok(())
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| Error::Auth(format!("HMAC: {e}")))?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}
