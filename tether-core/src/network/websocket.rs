// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Transport
//!
//! Production [`Dialer`] on tokio-tungstenite. Supports both native-tls and
//! rustls TLS backends, an extra trusted root certificate, and tunnelling
//! through SOCKS5 or HTTP CONNECT proxies.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::Connector;
use tracing::{debug, warn};
use url::Url;

use super::error::{NetworkError, NetworkResult};
use super::transport::{
    host_name, ConnectRequest, Dialer, ProxyConfig, SocketCommand, SocketEvent, SocketHandle,
    ABNORMAL_CLOSURE_CODE,
};

/// WebSocket dialer for `ws://` and `wss://` URLs.
///
/// # Example
///
/// ```ignore
/// use tether_core::network::{ConnectRequest, Dialer, WebSocketDialer};
///
/// let socket = WebSocketDialer::new()
///     .connect(ConnectRequest::new("wss://chat.example.com/v1/websocket/"))
///     .await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct WebSocketDialer;

impl WebSocketDialer {
    /// Creates a new WebSocket dialer.
    pub fn new() -> Self {
        WebSocketDialer
    }

    /// Parses a WebSocket URL into host, port and whether TLS is used.
    ///
    /// IPv6 hosts come back without brackets.
    fn parse_url(url: &str) -> Result<(String, u16, bool), NetworkError> {
        let parsed = Url::parse(url)?;
        let is_tls = match parsed.scheme() {
            "wss" => true,
            "ws" => false,
            _ => {
                return Err(NetworkError::InvalidUrl(
                    "Invalid URL scheme (expected ws:// or wss://)".into(),
                ))
            }
        };

        let host = host_name(&parsed)
            .ok_or_else(|| NetworkError::InvalidUrl(format!("No host in {}", url)))?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| NetworkError::InvalidUrl(format!("No port for {}", url)))?;

        Ok((host, port, is_tls))
    }

    async fn establish(request: ConnectRequest) -> NetworkResult<SocketHandle> {
        let (host, port, is_tls) = Self::parse_url(&request.url)?;
        let stream = open_tcp(&host, port, &request.proxy).await?;

        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| NetworkError::InvalidUrl(format!("Invalid WebSocket request: {}", e)))?;
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| NetworkError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| NetworkError::InvalidHeader(name.to_string()))?;
            ws_request.headers_mut().insert(name, value);
        }

        let connector = if is_tls {
            tls_connector(request.certificate_authority.as_deref())?
        } else {
            Connector::Plain
        };

        let (socket, _response) = tokio_tungstenite::client_async_tls_with_config(
            ws_request,
            stream,
            None,
            Some(connector),
        )
        .await
        .map_err(map_handshake_error)?;

        debug!(host = %host, port, "WebSocket connected");
        let (mut sink, mut source) = socket.split();
        let (commands, mut command_rx) = mpsc::unbounded_channel::<SocketCommand>();
        let (event_tx, events) = mpsc::unbounded_channel::<SocketEvent>();

        let writer_events = event_tx.clone();
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                let result = match command {
                    SocketCommand::Send(bytes) => sink.send(Message::Binary(bytes.into())).await,
                    SocketCommand::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        let result = sink.send(Message::Close(Some(frame))).await;
                        if result.is_ok() {
                            continue;
                        }
                        result
                    }
                };
                if let Err(e) = result {
                    warn!(error = %e, "WebSocket write failed");
                    let _ = writer_events.send(SocketEvent::Error(e.to_string()));
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let closed = loop {
                match source.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        let _ = event_tx.send(SocketEvent::Message(data.to_vec()));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => SocketEvent::Closed {
                                code: u16::from(frame.code),
                                reason: frame.reason.to_string(),
                            },
                            None => SocketEvent::Closed {
                                code: 1005,
                                reason: String::new(),
                            },
                        };
                    }
                    Some(Ok(Message::Text(_))) => {
                        let _ = event_tx.send(SocketEvent::Error("Unexpected text message".into()));
                    }
                    // Pings are answered by tungstenite itself
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        break SocketEvent::Closed {
                            code: ABNORMAL_CLOSURE_CODE,
                            reason: e.to_string(),
                        };
                    }
                    None => {
                        break SocketEvent::Closed {
                            code: ABNORMAL_CLOSURE_CODE,
                            reason: "Stream ended".into(),
                        };
                    }
                }
            };
            let _ = event_tx.send(closed);
        });

        Ok(SocketHandle::new(commands, events))
    }
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn connect(&self, request: ConnectRequest) -> NetworkResult<SocketHandle> {
        let timeout = request.connect_timeout;
        tokio::time::timeout(timeout, Self::establish(request))
            .await
            .map_err(|_| NetworkError::Timeout)?
    }
}

fn map_handshake_error(error: WsError) -> NetworkError {
    match error {
        WsError::Http(response) => {
            let status = response.status();
            match status.as_u16() {
                code @ (401 | 403) => NetworkError::AuthRejected { status: code },
                code => NetworkError::Http {
                    status: code,
                    message: status.canonical_reason().unwrap_or_default().to_string(),
                },
            }
        }
        WsError::Io(e) => NetworkError::Io(e.to_string()),
        other => NetworkError::ConnectionFailed(format!("WebSocket handshake failed: {}", other)),
    }
}

async fn open_tcp(host: &str, port: u16, proxy: &ProxyConfig) -> NetworkResult<TcpStream> {
    match proxy {
        ProxyConfig::None => Ok(TcpStream::connect((host, port)).await?),
        ProxyConfig::HttpConnect {
            host: proxy_host,
            port: proxy_port,
        } => {
            let mut stream = TcpStream::connect((proxy_host.as_str(), *proxy_port)).await?;
            // CONNECT needs the authority form, so IPv6 literals get brackets back.
            let target = if host.contains(':') {
                format!("[{}]", host)
            } else {
                host.to_string()
            };
            async_http_proxy::http_connect_tokio(&mut stream, &target, port)
                .await
                .map_err(|e| NetworkError::ConnectionFailed(format!("HTTP proxy: {}", e)))?;
            Ok(stream)
        }
        ProxyConfig::Socks5 {
            host: proxy_host,
            port: proxy_port,
            username,
            password,
        } => {
            let stream = TcpStream::connect((proxy_host.as_str(), *proxy_port)).await?;
            let tunnel = match username.as_deref() {
                Some(username) => {
                    Socks5Stream::connect_with_password_and_socket(
                        stream,
                        (host, port),
                        username,
                        password.as_deref().unwrap_or_default(),
                    )
                    .await
                }
                None => Socks5Stream::connect_with_socket(stream, (host, port)).await,
            }
            .map_err(|e| NetworkError::ConnectionFailed(format!("SOCKS5 proxy: {}", e)))?;
            Ok(tunnel.into_inner())
        }
    }
}

/// TLS connector using native-tls
#[cfg(all(feature = "network-native-tls", not(feature = "network-rustls")))]
fn tls_connector(certificate_authority: Option<&str>) -> NetworkResult<Connector> {
    let mut builder = native_tls::TlsConnector::builder();
    if let Some(pem) = certificate_authority {
        let certificate = native_tls::Certificate::from_pem(pem.as_bytes())
            .map_err(|e| NetworkError::ConnectionFailed(format!("Invalid CA: {}", e)))?;
        builder.add_root_certificate(certificate);
    }
    let connector = builder
        .build()
        .map_err(|e| NetworkError::ConnectionFailed(format!("TLS error: {}", e)))?;
    Ok(Connector::NativeTls(connector))
}

/// TLS connector using rustls
#[cfg(feature = "network-rustls")]
fn tls_connector(certificate_authority: Option<&str>) -> NetworkResult<Connector> {
    use rustls_pki_types::pem::PemObject;
    use rustls_pki_types::CertificateDer;
    use std::sync::Arc;

    // Create root certificate store from webpki roots
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(pem) = certificate_authority {
        for certificate in CertificateDer::pem_slice_iter(pem.as_bytes()) {
            let certificate = certificate
                .map_err(|e| NetworkError::ConnectionFailed(format!("Invalid CA: {}", e)))?;
            root_store
                .add(certificate)
                .map_err(|e| NetworkError::ConnectionFailed(format!("Invalid CA: {}", e)))?;
        }
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Connector::Rustls(Arc::new(config)))
}

// INLINE_TEST_REQUIRED: Tests private parse_url function for URL parsing logic
#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_url_wss() {
        let (host, port, is_tls) =
            WebSocketDialer::parse_url("wss://chat.example.com").unwrap();
        assert_eq!(host, "chat.example.com");
        assert_eq!(port, 443);
        assert!(is_tls);
    }

    #[test]
    fn test_parse_url_ws() {
        let (host, port, is_tls) = WebSocketDialer::parse_url("ws://localhost:8080").unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 8080);
        assert!(!is_tls);
    }

    #[test]
    fn test_parse_url_with_path_and_query() {
        let (host, port, is_tls) =
            WebSocketDialer::parse_url("wss://chat.example.com:9000/v1/websocket/?version=1")
                .unwrap();
        assert_eq!(host, "chat.example.com");
        assert_eq!(port, 9000);
        assert!(is_tls);

        let (host, port, _) =
            WebSocketDialer::parse_url("ws://chat.example.com?version=1").unwrap();
        assert_eq!(host, "chat.example.com");
        assert_eq!(port, 80);
    }

    #[test]
    fn test_parse_url_ipv6_host() {
        let (host, port, is_tls) = WebSocketDialer::parse_url("wss://[::1]/v1/websocket/").unwrap();
        assert_eq!(host, "::1");
        assert_eq!(port, 443);
        assert!(is_tls);

        let (host, port, _) =
            WebSocketDialer::parse_url("ws://[2001:db8::7]:8443/v1/websocket/?version=1").unwrap();
        assert_eq!(host, "2001:db8::7");
        assert_eq!(port, 8443);
    }

    #[test]
    fn test_parse_url_missing_host() {
        assert!(matches!(
            WebSocketDialer::parse_url("wss://:443/v1/websocket/"),
            Err(NetworkError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_parse_url_invalid_scheme() {
        let result = WebSocketDialer::parse_url("http://example.com");
        assert!(matches!(result, Err(NetworkError::InvalidUrl(_))));
    }

    async fn read_until_blank_line(stream: &mut TcpStream) -> String {
        let mut received = Vec::new();
        let mut buffer = [0u8; 256];
        while !received.ends_with(b"\r\n\r\n") {
            let read = stream.read(&mut buffer).await.unwrap();
            assert!(read > 0, "proxy client hung up");
            received.extend_from_slice(&buffer[..read]);
        }
        String::from_utf8(received).unwrap()
    }

    #[tokio::test]
    async fn test_http_proxy_sends_connect_and_reports_refusal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_port = listener.local_addr().unwrap().port();
        let proxy = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_until_blank_line(&mut stream).await;
            stream
                .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            request
        });

        let config = ProxyConfig::HttpConnect {
            host: "127.0.0.1".into(),
            port: proxy_port,
        };
        let result = open_tcp("::1", 8443, &config).await;

        assert!(matches!(result, Err(NetworkError::ConnectionFailed(_))));
        let request = proxy.await.unwrap();
        assert!(request.starts_with("CONNECT [::1]:8443 HTTP/1.1\r\n"), "{}", request);
    }

    #[tokio::test]
    async fn test_socks5_proxy_without_acceptable_method_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_port = listener.local_addr().unwrap().port();
        let proxy = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut version = [0u8; 1];
            stream.read_exact(&mut version).await.unwrap();
            // No acceptable authentication method.
            stream.write_all(&[0x05, 0xff]).await.unwrap();
            version[0]
        });

        let config = ProxyConfig::socks5("127.0.0.1", proxy_port);
        let result = open_tcp("chat.example.com", 443, &config).await;

        assert!(matches!(result, Err(NetworkError::ConnectionFailed(_))));
        assert_eq!(proxy.await.unwrap(), 0x05);
    }

    #[tokio::test]
    async fn test_connect_refused_is_transient() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut request = ConnectRequest::new(format!("ws://127.0.0.1:{}/", port));
        request.connect_timeout = std::time::Duration::from_secs(5);
        let err = WebSocketDialer::new().connect(request).await.unwrap_err();
        assert!(err.is_transient(), "unexpected error {:?}", err);
    }
}
