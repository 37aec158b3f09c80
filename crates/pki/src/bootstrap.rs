//! Cluster bootstrap material: the join token plus the server and client CAs.
//!
//! The reconciler generates it once and stores it in the token secret. The
//! kubelet bridge fetches it back from the running k3s server through the
//! join-token bootstrap endpoint.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use serde::Deserialize;
use tracing::debug;

use crate::ca::CertificateAuthority;
use crate::error::{PkiError, Result};

/// Secret key holding the join token
pub const TOKEN_KEY: &str = "token";
/// Secret key holding the server CA certificate
pub const SERVER_CA_CERT_KEY: &str = "server-ca.crt";
/// Secret key holding the server CA private key
pub const SERVER_CA_KEY_KEY: &str = "server-ca.key";
/// Secret key holding the client CA certificate
pub const CLIENT_CA_CERT_KEY: &str = "client-ca.crt";
/// Secret key holding the client CA private key
pub const CLIENT_CA_KEY_KEY: &str = "client-ca.key";

/// Path of the k3s bootstrap endpoint
pub const BOOTSTRAP_PATH: &str = "/v1-k3s/server-bootstrap";

/// Join token and cluster CAs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapData {
    pub token: String,
    pub server_ca: CertificateAuthority,
    pub client_ca: CertificateAuthority,
}

impl BootstrapData {
    /// Generate a fresh token and both CAs.
    pub fn generate() -> Result<Self> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Ok(Self {
            token: generate_token(),
            server_ca: CertificateAuthority::new(&format!("k3s-server-ca@{now}"))?,
            client_ca: CertificateAuthority::new(&format!("k3s-client-ca@{now}"))?,
        })
    }

    /// Secret data layout of the token secret
    #[must_use]
    pub fn to_secret_data(&self) -> BTreeMap<String, Vec<u8>> {
        BTreeMap::from([
            (TOKEN_KEY.to_string(), self.token.clone().into_bytes()),
            (
                SERVER_CA_CERT_KEY.to_string(),
                self.server_ca.cert_pem().as_bytes().to_vec(),
            ),
            (
                SERVER_CA_KEY_KEY.to_string(),
                self.server_ca.key_pem().as_bytes().to_vec(),
            ),
            (
                CLIENT_CA_CERT_KEY.to_string(),
                self.client_ca.cert_pem().as_bytes().to_vec(),
            ),
            (
                CLIENT_CA_KEY_KEY.to_string(),
                self.client_ca.key_pem().as_bytes().to_vec(),
            ),
        ])
    }

    /// Rebuild from the token secret data.
    pub fn from_secret_data(data: &BTreeMap<String, Vec<u8>>) -> Result<Self> {
        let field = |key: &str| -> Result<String> {
            let bytes = data
                .get(key)
                .ok_or_else(|| PkiError::InvalidBootstrap(format!("missing key {key}")))?;
            String::from_utf8(bytes.clone())
                .map_err(|e| PkiError::InvalidBootstrap(format!("{key} is not UTF-8: {e}")))
        };

        Ok(Self {
            token: field(TOKEN_KEY)?,
            server_ca: CertificateAuthority::from_pem(
                &field(SERVER_CA_CERT_KEY)?,
                &field(SERVER_CA_KEY_KEY)?,
            )?,
            client_ca: CertificateAuthority::from_pem(
                &field(CLIENT_CA_CERT_KEY)?,
                &field(CLIENT_CA_KEY_KEY)?,
            )?,
        })
    }
}

/// 32 random bytes, hex encoded
#[must_use]
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Fetches cluster CA material with a join token.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait]
pub trait BootstrapDecoder: Send + Sync {
    /// Decode bootstrap data served at `endpoint` (host or host:port)
    async fn decode(&self, token: &str, endpoint: &str) -> Result<BootstrapData>;
}

#[derive(Debug, Deserialize)]
struct BootstrapFile {
    #[serde(rename = "Content")]
    content: String,
}

#[derive(Debug, Deserialize)]
struct BootstrapResponse {
    #[serde(rename = "ServerCA")]
    server_ca: BootstrapFile,
    #[serde(rename = "ServerCAKey")]
    server_ca_key: BootstrapFile,
    #[serde(rename = "ClientCA")]
    client_ca: BootstrapFile,
    #[serde(rename = "ClientCAKey")]
    client_ca_key: BootstrapFile,
}

fn decode_file(name: &str, file: &BootstrapFile) -> Result<String> {
    let bytes = STANDARD
        .decode(file.content.as_bytes())
        .map_err(|e| PkiError::InvalidBootstrap(format!("{name}: {e}")))?;
    String::from_utf8(bytes).map_err(|e| PkiError::InvalidBootstrap(format!("{name}: {e}")))
}

fn parse_bootstrap_response(token: &str, body: &str) -> Result<BootstrapData> {
    let response: BootstrapResponse = serde_json::from_str(body)
        .map_err(|e| PkiError::InvalidBootstrap(format!("malformed response: {e}")))?;

    Ok(BootstrapData {
        token: token.to_string(),
        server_ca: CertificateAuthority::from_pem(
            &decode_file("ServerCA", &response.server_ca)?,
            &decode_file("ServerCAKey", &response.server_ca_key)?,
        )?,
        client_ca: CertificateAuthority::from_pem(
            &decode_file("ClientCA", &response.client_ca)?,
            &decode_file("ClientCAKey", &response.client_ca_key)?,
        )?,
    })
}

/// Decoder talking to the k3s server bootstrap endpoint.
///
/// The server presents a certificate signed by the very CA being fetched, so
/// the TLS connection cannot be verified at this point. The join token is the
/// credential.
#[derive(Debug, Clone)]
pub struct HttpBootstrapDecoder {
    client: reqwest::Client,
}

impl HttpBootstrapDecoder {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BootstrapDecoder for HttpBootstrapDecoder {
    async fn decode(&self, token: &str, endpoint: &str) -> Result<BootstrapData> {
        let url = format!("https://{endpoint}{BOOTSTRAP_PATH}");
        debug!(url = %url, "Fetching bootstrap data");

        let response = self
            .client
            .get(&url)
            .basic_auth("server", Some(token))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(PkiError::BootstrapStatus {
                status: status.as_u16(),
                body,
            });
        }

        parse_bootstrap_response(token, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(pem: &str) -> String {
        STANDARD.encode(pem.as_bytes())
    }

    #[test]
    fn test_token_is_64_hex_chars() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn test_secret_data_round_trip() {
        let data = BootstrapData::generate().unwrap();
        let secret = data.to_secret_data();
        assert_eq!(secret.len(), 5);
        assert_eq!(BootstrapData::from_secret_data(&secret).unwrap(), data);
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let mut secret = BootstrapData::generate().unwrap().to_secret_data();
        secret.remove(CLIENT_CA_KEY_KEY);
        let err = BootstrapData::from_secret_data(&secret).unwrap_err();
        assert!(matches!(err, PkiError::InvalidBootstrap(msg) if msg.contains("client-ca.key")));
    }

    #[test]
    fn test_parse_bootstrap_response() {
        let data = BootstrapData::generate().unwrap();
        let body = serde_json::json!({
            "ServerCA": {"Timestamp": "2024-01-01T00:00:00Z", "Content": encode(data.server_ca.cert_pem())},
            "ServerCAKey": {"Timestamp": "2024-01-01T00:00:00Z", "Content": encode(data.server_ca.key_pem())},
            "ClientCA": {"Timestamp": "2024-01-01T00:00:00Z", "Content": encode(data.client_ca.cert_pem())},
            "ClientCAKey": {"Timestamp": "2024-01-01T00:00:00Z", "Content": encode(data.client_ca.key_pem())},
        })
        .to_string();

        let parsed = parse_bootstrap_response(&data.token, &body).unwrap();
        assert_eq!(parsed, data);
    }

    #[test]
    fn test_parse_bootstrap_response_rejects_bad_base64() {
        let body = serde_json::json!({
            "ServerCA": {"Content": "!!!"},
            "ServerCAKey": {"Content": "!!!"},
            "ClientCA": {"Content": "!!!"},
            "ClientCAKey": {"Content": "!!!"},
        })
        .to_string();

        assert!(matches!(
            parse_bootstrap_response("t", &body),
            Err(PkiError::InvalidBootstrap(_))
        ));
    }

    #[tokio::test]
    async fn test_mock_decoder() {
        let data = BootstrapData::generate().unwrap();
        let expected = data.clone();

        let mut decoder = MockBootstrapDecoder::new();
        decoder
            .expect_decode()
            .withf(|token, endpoint| token == "abc" && endpoint == "k3k-c-service.ns")
            .times(1)
            .returning(move |_, _| Ok(data.clone()));

        let decoded = decoder.decode("abc", "k3k-c-service.ns").await.unwrap();
        assert_eq!(decoded, expected);
    }
}
