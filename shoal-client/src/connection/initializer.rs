//! One-time connection initialization: HELLO, error map, SASL, bucket.

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use shoal_core::protocol::constants::*;
use shoal_core::{ErrorMap, KvRequest, KvResponse, Result, ShoalError};

use super::connection::{Connection, KvConnection};
use super::scram::{self, ScramSha1};
use crate::config::ClientConfig;

/// Client identifier sent in the HELLO key.
const CLIENT_ID: &str = concat!("shoal-rs/", env!("CARGO_PKG_VERSION"));

/// Outcome of connection initialization.
#[derive(Debug)]
pub struct NegotiatedSession {
    /// Features both sides agreed on.
    pub features: Vec<u16>,
    /// Error map published by the server, when xerror was negotiated.
    pub error_map: Option<ErrorMap>,
}

impl NegotiatedSession {
    /// Returns `true` if the given feature was negotiated.
    pub fn has_feature(&self, feature: u16) -> bool {
        self.features.contains(&feature)
    }
}

/// Runs the authentication and negotiation sequence on a fresh connection.
///
/// Performed exactly once per connection: HELLO with the client's feature
/// set, GET_ERROR_MAP when xerror was accepted, SASL (PLAIN over TLS,
/// SCRAM-SHA-1 otherwise), and SELECT_BUCKET when the connection is born
/// into a bucket.
pub async fn initialize(
    connection: &Connection,
    config: &ClientConfig,
    bucket: Option<&str>,
) -> Result<NegotiatedSession> {
    let features = hello(connection, config).await?;
    connection.set_features(features.clone());

    let error_map = if features.contains(&FEATURE_XERROR) {
        Some(fetch_error_map(connection).await?)
    } else {
        None
    };

    authenticate(connection, config).await?;

    if let Some(bucket) = bucket {
        connection.select_bucket(bucket).await?;
    }

    tracing::debug!(
        id = %connection.id(),
        features = features.len(),
        has_error_map = error_map.is_some(),
        "connection initialized"
    );

    Ok(NegotiatedSession { features, error_map })
}

fn feature_set(config: &ClientConfig) -> Vec<u16> {
    let mut features = vec![
        FEATURE_TCP_NODELAY,
        FEATURE_XATTR,
        FEATURE_XERROR,
        FEATURE_SELECT_BUCKET,
        FEATURE_ALT_REQUEST,
        FEATURE_SYNC_REPLICATION,
        FEATURE_COLLECTIONS,
    ];
    if config.enable_mutation_tokens() {
        features.push(FEATURE_MUTATION_SEQNO);
    }
    if config.enable_operation_duration_tracing() {
        features.push(FEATURE_SERVER_DURATION);
    }
    features
}

async fn hello(connection: &Connection, config: &ClientConfig) -> Result<Vec<u16>> {
    let request = KvRequest::hello(CLIENT_ID, &feature_set(config));
    let response = connection.send(request, CancellationToken::new()).await?;

    if response.status() != STATUS_SUCCESS {
        return Err(ShoalError::Protocol(format!(
            "HELLO rejected with status 0x{:04x}",
            response.status()
        )));
    }

    if response.value.len() % 2 != 0 {
        return Err(ShoalError::Protocol(
            "HELLO response carries a truncated feature list".to_string(),
        ));
    }

    Ok(response
        .value
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

async fn fetch_error_map(connection: &Connection) -> Result<ErrorMap> {
    let response = connection
        .send(KvRequest::get_error_map(1), CancellationToken::new())
        .await?;
    if response.status() != STATUS_SUCCESS {
        return Err(ShoalError::Protocol(format!(
            "GET_ERROR_MAP rejected with status 0x{:04x}",
            response.status()
        )));
    }
    ErrorMap::parse(&response.value)
}

async fn authenticate(connection: &Connection, config: &ClientConfig) -> Result<()> {
    if config.username().is_empty() {
        return Ok(());
    }

    let mechanisms = list_mechanisms(connection).await?;

    // PLAIN is acceptable only when TLS hides the credentials.
    if config.tls_enabled() && mechanisms.iter().any(|m| m == "PLAIN") {
        return sasl_plain(connection, config).await;
    }
    if mechanisms.iter().any(|m| m == scram::MECHANISM) {
        return sasl_scram(connection, config).await;
    }

    Err(ShoalError::AuthenticationFailure(format!(
        "no mutually supported SASL mechanism (server offers: {})",
        mechanisms.join(", ")
    )))
}

async fn list_mechanisms(connection: &Connection) -> Result<Vec<String>> {
    let response = connection
        .send(KvRequest::sasl_list_mechanisms(), CancellationToken::new())
        .await?;
    if response.status() != STATUS_SUCCESS {
        return Err(ShoalError::AuthenticationFailure(format!(
            "mechanism listing rejected with status 0x{:04x}",
            response.status()
        )));
    }
    Ok(String::from_utf8_lossy(&response.value)
        .split_whitespace()
        .map(str::to_string)
        .collect())
}

async fn sasl_plain(connection: &Connection, config: &ClientConfig) -> Result<()> {
    let mut payload = Vec::with_capacity(
        config.username().len() + config.password().len() + 2,
    );
    payload.push(0);
    payload.extend_from_slice(config.username().as_bytes());
    payload.push(0);
    payload.extend_from_slice(config.password().as_bytes());

    let response = connection
        .send(
            KvRequest::sasl_auth("PLAIN", Bytes::from(payload)),
            CancellationToken::new(),
        )
        .await?;
    expect_auth_success(&response)
}

async fn sasl_scram(connection: &Connection, config: &ClientConfig) -> Result<()> {
    let mut scram = ScramSha1::new(config.username(), config.password());

    let response = connection
        .send(
            KvRequest::sasl_auth(
                scram::MECHANISM,
                Bytes::from(scram.client_first().into_bytes()),
            ),
            CancellationToken::new(),
        )
        .await?;

    if response.status() != STATUS_AUTH_CONTINUE {
        // Some servers answer a one-step conversation with plain success.
        return expect_auth_success(&response);
    }

    let server_first = String::from_utf8_lossy(&response.value).into_owned();
    let client_final = scram.client_final(&server_first)?;

    let response = connection
        .send(
            KvRequest::sasl_step(scram::MECHANISM, Bytes::from(client_final.into_bytes())),
            CancellationToken::new(),
        )
        .await?;
    expect_auth_success(&response)?;

    let server_final = String::from_utf8_lossy(&response.value).into_owned();
    scram.verify_server_final(&server_final)
}

fn expect_auth_success(response: &KvResponse) -> Result<()> {
    match response.status() {
        STATUS_SUCCESS => Ok(()),
        STATUS_AUTH_ERROR | STATUS_AUTH_STALE | STATUS_EACCESS => {
            Err(ShoalError::AuthenticationFailure(format!(
                "server refused credentials (status 0x{:04x})",
                response.status()
            )))
        }
        other => Err(ShoalError::AuthenticationFailure(format!(
            "unexpected authentication status 0x{other:04x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_set_honors_config() {
        let base = ClientConfig::builder()
            .enable_mutation_tokens(false)
            .build()
            .unwrap();
        let features = feature_set(&base);
        assert!(features.contains(&FEATURE_XERROR));
        assert!(features.contains(&FEATURE_SELECT_BUCKET));
        assert!(!features.contains(&FEATURE_MUTATION_SEQNO));
        assert!(!features.contains(&FEATURE_SERVER_DURATION));

        let traced = ClientConfig::builder()
            .enable_operation_duration_tracing(true)
            .build()
            .unwrap();
        assert!(feature_set(&traced).contains(&FEATURE_SERVER_DURATION));
        assert!(feature_set(&traced).contains(&FEATURE_MUTATION_SEQNO));
    }

    #[test]
    fn test_expect_auth_success_classification() {
        use shoal_core::protocol::ResponseHeader;

        let make = |status: u16| KvResponse {
            header: ResponseHeader {
                magic: MAGIC_RESPONSE,
                opcode: OP_SASL_AUTH,
                key_length: 0,
                extras_length: 0,
                framing_extras_length: 0,
                datatype: DATATYPE_RAW,
                status,
                total_body_length: 0,
                opaque: 1,
                cas: 0,
            },
            framing_extras: Bytes::new(),
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        };

        assert!(expect_auth_success(&make(STATUS_SUCCESS)).is_ok());
        assert!(matches!(
            expect_auth_success(&make(STATUS_AUTH_ERROR)),
            Err(ShoalError::AuthenticationFailure(_))
        ));
        assert!(expect_auth_success(&make(STATUS_TEMPORARY_FAILURE)).is_err());
    }
}
