//! TLS certificate loading.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;

use super::ServerError;

/// Builds a TLS acceptor from a PEM certificate chain and a PEM private key
/// (PKCS#1, PKCS#8 or SEC1).
pub(crate) fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ServerError> {
    let certs = rustls_pemfile::certs(&mut open(cert_path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ServerError::Pem {
            path: cert_path.display().to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(ServerError::NoCertificates(cert_path.display().to_string()));
    }

    let key = rustls_pemfile::private_key(&mut open(key_path)?)
        .map_err(|source| ServerError::Pem {
            path: key_path.display().to_string(),
            source,
        })?
        .ok_or_else(|| ServerError::NoPrivateKey(key_path.display().to_string()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn open(path: &Path) -> Result<BufReader<File>, ServerError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| ServerError::Pem {
            path: path.display().to_string(),
            source,
        })
}
