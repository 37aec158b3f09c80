//! rustls configuration of the bridge listeners.

use std::sync::Arc;

use rustls::RootCertStore;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ServerConfig, WebPkiClientVerifier};

use crate::credentials::ServingMaterial;
use crate::error::KubeletError;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn certificates(pem_data: &str) -> Result<Vec<CertificateDer<'static>>, KubeletError> {
    let blocks = pem::parse_many(pem_data.as_bytes()).map_err(|e| KubeletError::Server(format!("certificate PEM: {e}")))?;
    let certs: Vec<_> = blocks
        .into_iter()
        .filter(|b| b.tag() == "CERTIFICATE")
        .map(|b| CertificateDer::from(b.into_contents()))
        .collect();
    if certs.is_empty() {
        return Err(KubeletError::Server("no certificate in PEM".to_string()));
    }
    Ok(certs)
}

fn private_key(pem_data: &str) -> Result<PrivateKeyDer<'static>, KubeletError> {
    let block = pem::parse(pem_data.as_bytes()).map_err(|e| KubeletError::Server(format!("key PEM: {e}")))?;
    match block.tag() {
        "PRIVATE KEY" => Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(block.into_contents()))),
        other => Err(KubeletError::Server(format!("unsupported key type {other}"))),
    }
}

fn builder() -> Result<rustls::ConfigBuilder<ServerConfig, rustls::WantsVerifier>, KubeletError> {
    ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| KubeletError::Server(e.to_string()))
}

fn finish(mut config: ServerConfig) -> Arc<ServerConfig> {
    // Websocket upgrades need HTTP/1.1
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Server config requiring client certificates signed by `client_ca_pem`
pub fn mutual_tls(material: &ServingMaterial, client_ca_pem: &str) -> Result<Arc<ServerConfig>, KubeletError> {
    let mut roots = RootCertStore::empty();
    for cert in certificates(client_ca_pem)? {
        roots
            .add(cert)
            .map_err(|e| KubeletError::Server(format!("client CA: {e}")))?;
    }
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
        .build()
        .map_err(|e| KubeletError::Server(format!("client verifier: {e}")))?;

    let config = builder()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certificates(&material.cert_pem)?, private_key(&material.key_pem)?)
        .map_err(|e| KubeletError::Server(e.to_string()))?;
    Ok(finish(config))
}

/// Server config without client authentication
pub fn server_only(material: &ServingMaterial) -> Result<Arc<ServerConfig>, KubeletError> {
    let config = builder()?
        .with_no_client_auth()
        .with_single_cert(certificates(&material.cert_pem)?, private_key(&material.key_pem)?)
        .map_err(|e| KubeletError::Server(e.to_string()))?;
    Ok(finish(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pki::{BootstrapData, KeyUsage};
    use std::time::Duration;

    fn material(bootstrap: &BootstrapData) -> ServingMaterial {
        let (cert_pem, key_pem) = bootstrap
            .server_ca
            .issue("node", &[], &["node".to_string()], &[KeyUsage::ServerAuth], Duration::ZERO)
            .unwrap();
        ServingMaterial {
            cert_pem,
            key_pem,
            ca_pem: bootstrap.server_ca.cert_pem().to_string(),
        }
    }

    #[test]
    fn test_configs_build_from_issued_material() {
        let bootstrap = BootstrapData::generate().unwrap();
        let material = material(&bootstrap);

        let mtls = mutual_tls(&material, bootstrap.client_ca.cert_pem()).unwrap();
        assert_eq!(mtls.alpn_protocols, vec![b"http/1.1".to_vec()]);
        server_only(&material).unwrap();
    }

    #[test]
    fn test_garbage_is_rejected() {
        let bootstrap = BootstrapData::generate().unwrap();
        let mut material = material(&bootstrap);
        material.key_pem = "not a key".to_string();
        assert!(matches!(server_only(&material), Err(KubeletError::Server(_))));
        assert!(matches!(
            mutual_tls(&material, "no CA here"),
            Err(KubeletError::Server(_))
        ));
    }
}
