use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use log::{error, info, warn};
use peer_relay::{routes, App, Config};
use rustls::crypto::ring;
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use thiserror::Error;

#[derive(Error, Debug)]
enum TlsError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("no certificates in {0}")]
    NoCertificates(String),
    #[error("no private key in {0}")]
    NoPrivateKey(String),
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path).map(BufReader::new).map_err(|source| TlsError::Read {
        path: path.display().to_string(),
        source,
    })
}

/// Checks that the certificate chain and key load and belong together.
fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, TlsError> {
    let read_err = |path: &Path| {
        let path = path.display().to_string();
        move |source: std::io::Error| TlsError::Read { path, source }
    };

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut open(cert_path)?)
        .collect::<Result<_, _>>()
        .map_err(read_err(cert_path))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(cert_path.display().to_string()));
    }

    let key = rustls_pemfile::private_key(&mut open(key_path)?)
        .map_err(read_err(key_path))?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.display().to_string()))?;

    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let app = App::new(&config);
    let routes = routes(app, config.static_dir.clone());
    let addr = config.addr();

    match load_tls_config(&config.tls_cert, &config.tls_key) {
        Ok(_) => {
            info!("Starting secure server (HTTPS/WSS) on {}", addr);
            warp::serve(routes)
                .tls()
                .cert_path(&config.tls_cert)
                .key_path(&config.tls_key)
                .run(addr)
                .await;
        }
        Err(e) => {
            warn!("TLS unavailable ({}), falling back to HTTP/WS", e);
            info!("Starting server on {}", addr);
            warp::serve(routes).run(addr).await;
        }
    }
}
