//! Certificate material and rustls server configuration for encrypted listeners

use crate::config::TlsOpts;
use crate::error::ConfigError;
use pkcs8::EncryptedPrivateKeyInfo;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig, SupportedCipherSuite};
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

const HTTP11_ALPN: &[u8] = b"http/1.1";
const ENCRYPTED_PKCS8_LABEL: &str = "ENCRYPTED PRIVATE KEY";

/// Certificate chain (leaf first) and private key for one listener
pub struct TlsMaterial {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Load the leaf certificate, the optional chain and the private key
pub fn load_material(opts: &TlsOpts) -> Result<TlsMaterial, ConfigError> {
    let mut certs = load_certs(&opts.cert)?;
    if !opts.chain.is_empty() {
        certs.extend(load_certs(&opts.chain)?);
    }

    let pem = read_file(&opts.key)?;
    let key = load_private_key(&pem, &opts.key_pass, &opts.key)?;

    Ok(TlsMaterial { certs, key })
}

fn read_file(path: &str) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_string(),
        source,
    })
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let pem = read_file(path)?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ConfigError::ReadFile {
            path: path.to_string(),
            source,
        })?;

    if certs.is_empty() {
        return Err(ConfigError::NoCertificates(path.to_string()));
    }
    Ok(certs)
}

/// Parse a PEM private key, decrypting it when it is an encrypted PKCS#8 key.
///
/// A pass phrase is required for encrypted keys and refused for plain ones.
pub fn load_private_key(pem: &str, passphrase: &str, path: &str) -> Result<PrivateKeyDer<'static>, ConfigError> {
    if pem.contains("Proc-Type: 4,ENCRYPTED") {
        return Err(ConfigError::LegacyEncryptedKey(path.to_string()));
    }

    if let Some(block) = pem_block(pem, ENCRYPTED_PKCS8_LABEL) {
        if passphrase.is_empty() {
            return Err(ConfigError::MissingPassphrase(path.to_string()));
        }
        return decrypt_pkcs8(block, passphrase, path);
    }

    if !passphrase.is_empty() {
        return Err(ConfigError::UnexpectedPassphrase(path.to_string()));
    }

    let mut reader = BufReader::new(pem.as_bytes());
    loop {
        let item = rustls_pemfile::read_one(&mut reader).map_err(|e| ConfigError::KeyDecrypt {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        match item {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    Err(ConfigError::NoPrivateKey(path.to_string()))
}

/// The first PEM block with `label`, armour included
fn pem_block<'a>(pem: &'a str, label: &str) -> Option<&'a str> {
    let begin = format!("-----BEGIN {}-----", label);
    let end = format!("-----END {}-----", label);
    let start = pem.find(&begin)?;
    let stop = pem[start..].find(&end)? + start + end.len();
    Some(&pem[start..stop])
}

fn decrypt_pkcs8(block: &str, passphrase: &str, path: &str) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let failed = |reason: String| ConfigError::KeyDecrypt {
        path: path.to_string(),
        reason,
    };

    let (_, der) = pkcs8::der::pem::decode_vec(block.as_bytes()).map_err(|e| failed(e.to_string()))?;
    let info = EncryptedPrivateKeyInfo::try_from(der.as_slice()).map_err(|e| failed(e.to_string()))?;
    let document = info
        .decrypt(passphrase)
        .map_err(|_| failed("decryption failed, check the pass phrase".to_string()))?;

    Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        document.as_bytes().to_vec(),
    )))
}

/// Cipher suites offered by encrypted listeners, in server preference order
pub fn allowed_cipher_suites() -> Vec<SupportedCipherSuite> {
    use rustls::crypto::ring::cipher_suite::*;
    vec![
        TLS13_AES_256_GCM_SHA384,
        TLS13_AES_128_GCM_SHA256,
        TLS13_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    ]
}

/// Make sure plain HTTP/1.1 is among the advertised application protocols
pub fn ensure_alpn(protocols: &mut Vec<Vec<u8>>) {
    if !protocols.iter().any(|p| p == HTTP11_ALPN) {
        protocols.push(HTTP11_ALPN.to_vec());
    }
}

/// TLS 1.2 minimum, curated suites, server cipher order
pub fn server_config(material: TlsMaterial) -> Result<ServerConfig, ConfigError> {
    let provider = CryptoProvider {
        cipher_suites: allowed_cipher_suites(),
        ..ring::default_provider()
    };

    let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(material.certs, material.key)?;

    config.ignore_client_order = true;
    ensure_alpn(&mut config.alpn_protocols);
    Ok(config)
}

/// Build the acceptor for an encrypted listener
pub fn acceptor(opts: &TlsOpts) -> Result<TlsAcceptor, ConfigError> {
    let material = load_material(opts)?;
    let chain_len = material.certs.len();
    let config = server_config(material)?;
    info!(cert = %opts.cert, key = %opts.key, chain_len, "TLS material loaded");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSPHRASE: &str = "gateway-test";

    fn fixture(name: &str) -> String {
        format!("{}/tests/certs/{}", env!("CARGO_MANIFEST_DIR"), name)
    }

    fn read(name: &str) -> String {
        std::fs::read_to_string(fixture(name)).unwrap()
    }

    fn opts(key: &str, key_pass: &str) -> TlsOpts {
        TlsOpts {
            key: fixture(key),
            key_pass: key_pass.to_string(),
            cert: fixture("leaf.pem"),
            chain: fixture("ca.pem"),
        }
    }

    #[test]
    fn test_plain_key() {
        let key = load_private_key(&read("leaf.key"), "", "leaf.key").unwrap();
        assert!(matches!(key, PrivateKeyDer::Pkcs8(_)));
    }

    #[test]
    fn test_plain_key_with_passphrase_rejected() {
        let err = load_private_key(&read("leaf.key"), PASSPHRASE, "leaf.key").unwrap_err();
        assert!(matches!(err, ConfigError::UnexpectedPassphrase(_)));
    }

    #[test]
    fn test_encrypted_key_decrypts_to_plain_key() {
        let decrypted = load_private_key(&read("leaf.enc.key"), PASSPHRASE, "leaf.enc.key").unwrap();
        let plain = load_private_key(&read("leaf.key"), "", "leaf.key").unwrap();
        assert_eq!(decrypted.secret_der(), plain.secret_der());
    }

    #[test]
    fn test_encrypted_key_without_passphrase() {
        let err = load_private_key(&read("leaf.enc.key"), "", "leaf.enc.key").unwrap_err();
        assert!(matches!(err, ConfigError::MissingPassphrase(_)));
    }

    #[test]
    fn test_encrypted_key_wrong_passphrase() {
        let err = load_private_key(&read("leaf.enc.key"), "wrong", "leaf.enc.key").unwrap_err();
        assert!(matches!(err, ConfigError::KeyDecrypt { .. }));
    }

    #[test]
    fn test_legacy_encrypted_key_rejected() {
        let err = load_private_key(&read("leaf.legacy.key"), PASSPHRASE, "leaf.legacy.key").unwrap_err();
        assert!(matches!(err, ConfigError::LegacyEncryptedKey(_)));
        assert!(err.to_string().contains("PKCS#8"));
    }

    #[test]
    fn test_no_key_in_file() {
        let err = load_private_key(&read("leaf.pem"), "", "leaf.pem").unwrap_err();
        assert!(matches!(err, ConfigError::NoPrivateKey(_)));
    }

    #[test]
    fn test_material_puts_leaf_first() {
        let material = load_material(&opts("leaf.enc.key", PASSPHRASE)).unwrap();
        assert_eq!(material.certs.len(), 2);

        let leaf = load_certs(&fixture("leaf.pem")).unwrap();
        assert_eq!(material.certs[0], leaf[0]);
    }

    #[test]
    fn test_missing_files() {
        let mut missing = opts("leaf.key", "");
        missing.cert = fixture("does-not-exist.pem");
        assert!(matches!(
            load_material(&missing),
            Err(ConfigError::ReadFile { .. })
        ));

        let mut empty_chain = opts("leaf.key", "");
        empty_chain.chain = fixture("leaf.key");
        assert!(matches!(
            load_material(&empty_chain),
            Err(ConfigError::NoCertificates(_))
        ));
    }

    #[test]
    fn test_server_config() {
        let material = load_material(&opts("leaf.key", "")).unwrap();
        let config = server_config(material).unwrap();
        assert!(config.ignore_client_order);
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
        assert!(acceptor(&opts("leaf.enc.key", PASSPHRASE)).is_ok());
    }

    #[test]
    fn test_cipher_allow_list() {
        let suites = allowed_cipher_suites();
        assert_eq!(suites.len(), 7);
        for suite in &suites {
            let name = format!("{:?}", suite.suite());
            assert!(name.contains("GCM") || name.contains("CHACHA20"), "{}", name);
        }
    }

    #[test]
    fn test_ensure_alpn() {
        let mut protocols = vec![b"h2".to_vec()];
        ensure_alpn(&mut protocols);
        ensure_alpn(&mut protocols);
        assert_eq!(protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }
}
