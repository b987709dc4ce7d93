use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::PrivateKeyDer;
use tokio_rustls::rustls::{self, SupportedCipherSuite};
use tokio_rustls::TlsAcceptor;

#[derive(Debug)]
pub enum TlsError {
    ReadCertFile {
        path: String,
        source: std::io::Error,
    },
    ReadKeyFile {
        path: String,
        source: std::io::Error,
    },
    NoPrivateKey {
        path: String,
    },
    Config(rustls::Error),
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadCertFile { path, source } => {
                write!(f, "failed to read certificate file '{path}': {source}")
            }
            Self::ReadKeyFile { path, source } => {
                write!(f, "failed to read private key file '{path}': {source}")
            }
            Self::NoPrivateKey { path } => {
                write!(f, "no PKCS#8 or RSA private key found in '{path}'")
            }
            Self::Config(source) => write!(f, "TLS configuration rejected: {source}"),
        }
    }
}

impl std::error::Error for TlsError {}

// Server-side cipher policy. The server picks in this order: AES-128-GCM
// ahead of AES-256-GCM ahead of ChaCha20, RSA key exchange ahead of ECDSA
// within each strength. TLS 1.3 suites lead because rustls negotiates the
// protocol version first.
pub fn mozilla_server_suites() -> Vec<SupportedCipherSuite> {
    vec![
        ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
        ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
        ring::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        ring::cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    ]
}

pub fn load_tls_acceptor(cert_file: &str, key_file: &str) -> Result<TlsAcceptor, TlsError> {
    let cert_reader = File::open(cert_file).map_err(|source| TlsError::ReadCertFile {
        path: cert_file.to_owned(),
        source,
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_reader))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::ReadCertFile {
            path: cert_file.to_owned(),
            source,
        })?;

    let key = load_private_key(key_file)?;

    let mut provider = ring::default_provider();
    provider.cipher_suites = mozilla_server_suites();

    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .map_err(TlsError::Config)?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(TlsError::Config)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_private_key(key_file: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let open = |path: &str| {
        File::open(path).map_err(|source| TlsError::ReadKeyFile {
            path: path.to_owned(),
            source,
        })
    };

    let mut pkcs8_reader = BufReader::new(open(key_file)?);
    let mut pkcs8 = rustls_pemfile::pkcs8_private_keys(&mut pkcs8_reader);
    if let Some(key) = pkcs8.next() {
        let key = key.map_err(|source| TlsError::ReadKeyFile {
            path: key_file.to_owned(),
            source,
        })?;
        return Ok(PrivateKeyDer::Pkcs8(key));
    }

    let mut rsa_reader = BufReader::new(open(key_file)?);
    let mut rsa = rustls_pemfile::rsa_private_keys(&mut rsa_reader);
    if let Some(key) = rsa.next() {
        let key = key.map_err(|source| TlsError::ReadKeyFile {
            path: key_file.to_owned(),
            source,
        })?;
        return Ok(PrivateKeyDer::Pkcs1(key));
    }

    Err(TlsError::NoPrivateKey {
        path: key_file.to_owned(),
    })
}
