use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_native_tls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;

use nanotdf::modules::config::{load_config, ServerSettings};
use nanotdf::modules::crypto::EcdhAesGcmBackend;
use nanotdf::modules::rewrap::service::malformed_reply;
use nanotdf::modules::rewrap::{KasService, TokenValidator};
use nanotdf::modules::secure_keys::SecureEcPrivateKey;
use nanotdf::SessionManager;

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let settings = load_config()?;
    let kas_private_key = load_kas_key(&settings)?;
    let tokens = match &settings.oauth_public_key_path {
        Some(path) => TokenValidator::from_ec_pem(&std::fs::read_to_string(path)?)?,
        None => TokenValidator::insecure(),
    };

    let sessions = SessionManager::spawn(settings.session_config());
    let mut service = KasService::new(
        Arc::new(EcdhAesGcmBackend::new(kas_private_key)),
        sessions,
        tokens,
    )
    .with_timing_logs(settings.enable_timing_logs);
    match &settings.kas_url {
        Some(locator) => {
            info!("Serving headers addressed to {}", locator);
            service = service.with_kas_locator(locator.clone());
        }
        None => warn!("KAS_URL not set, accepting headers addressed to any KAS"),
    }
    let service = Arc::new(service);

    let tls_acceptor = if settings.tls_enabled {
        Some(load_tls_config(&settings.tls_cert_path, &settings.tls_key_path)?)
    } else {
        None
    };

    let listener = TcpListener::bind(format!("0.0.0.0:{}", settings.port)).await?;
    info!("KAS listening on port {} (tls: {})", settings.port, settings.tls_enabled);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                let service = service.clone();
                let tls_acceptor = tls_acceptor.clone();
                let settings = settings.clone();

                tokio::spawn(async move {
                    let stream: Box<dyn AsyncStream> = match tls_acceptor {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => Box::new(tls_stream),
                            Err(e) => {
                                warn!("Failed to accept TLS connection from {}: {}", peer, e);
                                return;
                            }
                        },
                        None => Box::new(stream),
                    };
                    handle_connection(stream, peer, service, &settings).await;
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn load_kas_key(settings: &ServerSettings) -> Result<SecureEcPrivateKey, Box<dyn std::error::Error>> {
    match &settings.kas_key_path {
        Some(path) => {
            let pem = std::fs::read_to_string(path)?;
            Ok(SecureEcPrivateKey::from_pem(&pem)?)
        }
        None => {
            warn!("KAS_KEY_PATH not set, generating an ephemeral KAS key");
            Ok(SecureEcPrivateKey::generate())
        }
    }
}

fn load_tls_config(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, Box<dyn std::error::Error>> {
    let cert = std::fs::read(cert_path)?;
    let key = std::fs::read(key_path)?;

    let identity = native_tls::Identity::from_pkcs8(&cert, &key)?;
    let acceptor = native_tls::TlsAcceptor::new(identity)?;

    Ok(TlsAcceptor::from(acceptor))
}

fn log_timing(settings: &ServerSettings, message: &str, duration: std::time::Duration) {
    if settings.enable_timing_logs {
        info!("{}: {:?}", message, duration);
    }
}

async fn handle_connection(
    stream: Box<dyn AsyncStream>,
    peer: SocketAddr,
    service: Arc<KasService>,
    settings: &ServerSettings,
) {
    let mut ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Failed to accept websocket from {}: {}", peer, e);
            return;
        }
    };
    info!("Connection from {}", peer);
    let client_ip = peer.ip().to_string();

    while let Some(incoming) = ws_stream.next().await {
        let message = match incoming {
            Ok(message) => message,
            Err(e) => {
                warn!("Error reading message from {}: {}", peer, e);
                break;
            }
        };

        let reply = match message {
            Message::Binary(data) => {
                let start_time = Instant::now();
                let reply = service.handle_message(&data, Some(&client_ip)).await;
                log_timing(settings, "Time to handle message", start_time.elapsed());
                reply
            }
            Message::Text(_) => malformed_reply("text frames are not supported"),
            Message::Close(_) => break,
            _ => continue,
        };

        if ws_stream.send(Message::Binary(reply)).await.is_err() {
            error!("Failed to send response to {}", peer);
            break;
        }
    }
    info!("Connection from {} closed", peer);
}
