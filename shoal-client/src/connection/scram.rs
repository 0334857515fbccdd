//! SCRAM-SHA-1 client-side conversation.
//!
//! Used for SASL on plaintext connections, where PLAIN would expose the
//! password. The conversation is two round-trips: client-first /
//! server-first, then client-final / server-final.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha1::{Digest, Sha1};

use shoal_core::{Result, ShoalError};

type HmacSha1 = Hmac<Sha1>;

/// The SASL mechanism name this conversation implements.
pub const MECHANISM: &str = "SCRAM-SHA-1";

/// An in-progress SCRAM-SHA-1 conversation.
#[derive(Debug)]
pub struct ScramSha1 {
    username: String,
    password: String,
    client_nonce: String,
    client_first_bare: String,
    server_signature: Option<Vec<u8>>,
}

impl ScramSha1 {
    /// Starts a conversation for the given credentials.
    pub fn new(username: &str, password: &str) -> Self {
        let client_nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        Self::with_nonce(username, password, client_nonce)
    }

    fn with_nonce(username: &str, password: &str, client_nonce: String) -> Self {
        let client_first_bare = format!("n={},r={}", saslname(username), client_nonce);
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce,
            client_first_bare,
            server_signature: None,
        }
    }

    /// Returns the client-first message.
    pub fn client_first(&self) -> String {
        format!("n,,{}", self.client_first_bare)
    }

    /// Consumes the server-first message and produces the client-final.
    pub fn client_final(&mut self, server_first: &str) -> Result<String> {
        let fields = parse_fields(server_first);

        let combined_nonce = fields
            .iter()
            .find(|(k, _)| *k == "r")
            .map(|(_, v)| *v)
            .ok_or_else(|| auth_err("server-first missing nonce"))?;
        if !combined_nonce.starts_with(&self.client_nonce) {
            return Err(auth_err("server nonce does not extend client nonce"));
        }

        let salt = fields
            .iter()
            .find(|(k, _)| *k == "s")
            .map(|(_, v)| *v)
            .ok_or_else(|| auth_err("server-first missing salt"))?;
        let salt = BASE64
            .decode(salt)
            .map_err(|_| auth_err("server salt is not valid base64"))?;

        let iterations: u32 = fields
            .iter()
            .find(|(k, _)| *k == "i")
            .and_then(|(_, v)| v.parse().ok())
            .ok_or_else(|| auth_err("server-first missing iteration count"))?;
        if iterations == 0 {
            return Err(auth_err("zero iteration count"));
        }

        let mut salted_password = [0u8; 20];
        pbkdf2::pbkdf2_hmac::<Sha1>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );

        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key = Sha1::digest(&client_key);

        let without_proof = format!("c=biws,r={combined_nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, without_proof
        );

        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let server_key = hmac(&salted_password, b"Server Key");
        self.server_signature = Some(hmac(&server_key, auth_message.as_bytes()));

        Ok(format!(
            "{without_proof},p={}",
            BASE64.encode(client_proof)
        ))
    }

    /// Verifies the server-final message against the expected signature.
    pub fn verify_server_final(&self, server_final: &str) -> Result<()> {
        let fields = parse_fields(server_final);

        if let Some((_, message)) = fields.iter().find(|(k, _)| *k == "e") {
            return Err(auth_err(&format!("server rejected credentials: {message}")));
        }

        let verifier = fields
            .iter()
            .find(|(k, _)| *k == "v")
            .map(|(_, v)| *v)
            .ok_or_else(|| auth_err("server-final missing verifier"))?;
        let verifier = BASE64
            .decode(verifier)
            .map_err(|_| auth_err("server verifier is not valid base64"))?;

        let expected = self
            .server_signature
            .as_ref()
            .ok_or_else(|| auth_err("client-final was never produced"))?;

        if &verifier == expected {
            Ok(())
        } else {
            Err(auth_err(&format!(
                "server signature mismatch for user '{}'",
                self.username
            )))
        }
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn parse_fields(message: &str) -> Vec<(&str, &str)> {
    message
        .split(',')
        .filter_map(|field| field.split_once('='))
        .collect()
}

/// Escapes `=` and `,` in a username per the SCRAM grammar.
fn saslname(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

fn auth_err(message: &str) -> ShoalError {
    ShoalError::AuthenticationFailure(message.to_string())
}
