//! HTTP Client
//!
//! Uses hyper with tokio for async HTTP/1.1.
//! Features:
//! - Automatic HTTPS with rustls (memory-safe TLS)
//! - Request and connect timeouts
//! - Response body size limit

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, CONTENT_TYPE, HOST, USER_AGENT};
use hyper::{Method, Request, StatusCode, Uri};
use rustls::ClientConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// HTTP client errors
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timeout")]
    Timeout,

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Body read error: {0}")]
    BodyError(String),

    #[error("Response body too large ({size} bytes, limit {limit})")]
    BodyTooLarge { size: usize, limit: usize },
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Request timeout
    pub timeout: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// User-Agent string
    pub user_agent: String,
    /// Maximum response body size
    pub max_body_size: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: "pbs-tv/0.1".to_string(),
            max_body_size: 10 * 1024 * 1024, // 10 MB
        }
    }
}

/// HTTP response wrapper
#[derive(Debug)]
pub struct Response {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Vec<u8>,
    /// Time to first byte
    pub ttfb: Duration,
    /// Total download time
    pub total_time: Duration,
}

impl Response {
    /// Check if response was successful (2xx)
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Get body as string
    pub fn text(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.clone())
    }

    /// Get Content-Type header
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE)?.to_str().ok()
    }
}

/// Async HTTP/1.1 client
pub struct HttpClient {
    config: HttpClientConfig,
    requests_made: AtomicU64,
    bytes_downloaded: AtomicU64,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(config: HttpClientConfig) -> Self {
        info!(
            "HTTP client initialized (timeout: {:?}, connect timeout: {:?})",
            config.timeout, config.connect_timeout
        );

        Self {
            config,
            requests_made: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(HttpClientConfig::default())
    }

    /// Perform a GET request
    pub async fn get(&self, url: &str) -> Result<Response, HttpError> {
        self.request(Method::GET, url, None).await
    }

    /// Perform a POST request
    pub async fn post(&self, url: &str, body: Vec<u8>) -> Result<Response, HttpError> {
        self.request(Method::POST, url, Some(body)).await
    }

    /// Perform an HTTP request, bounded by the configured request timeout
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Response, HttpError> {
        tokio::time::timeout(self.config.timeout, self.request_inner(method, url, body))
            .await
            .map_err(|_| HttpError::Timeout)?
    }

    async fn request_inner(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Response, HttpError> {
        let start = Instant::now();
        self.requests_made.fetch_add(1, Ordering::Relaxed);

        // 1. Parse URL
        let uri: Uri = url
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| HttpError::InvalidUrl(e.to_string()))?;

        let is_https = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            other => {
                return Err(HttpError::InvalidUrl(format!(
                    "Unsupported scheme: {}",
                    other.unwrap_or("<none>")
                )));
            }
        };
        let host = uri
            .host()
            .ok_or_else(|| HttpError::InvalidUrl("No host in URL".to_string()))?
            .to_string();
        let port = uri.port_u16().unwrap_or(if is_https { 443 } else { 80 });

        // 2. Build request
        let request = Request::builder()
            .method(method.clone())
            .uri(&uri)
            .header(USER_AGENT, &self.config.user_agent)
            .header(HOST, &host)
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| HttpError::HttpError(e.to_string()))?;

        // 3. Connect
        let addr = format!("{}:{}", host, port);
        let ttfb_start = Instant::now();

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            tokio::net::TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| HttpError::ConnectionFailed(format!("connect to {} timed out", addr)))?
        .map_err(|e| HttpError::ConnectionFailed(e.to_string()))?;

        // 4. Send, wrapping in TLS for https
        let response = if is_https {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            let tls_config = ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();

            let connector = TlsConnector::from(Arc::new(tls_config));
            let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|_| HttpError::TlsError("Invalid server name".to_string()))?;

            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| HttpError::TlsError(e.to_string()))?;

            send_over(tls_stream, request).await?
        } else {
            send_over(stream, request).await?
        };

        let ttfb = ttfb_start.elapsed();

        // 5. Read response
        let status = response.status();
        let headers = response.headers().clone();

        let collected = response
            .into_body()
            .collect()
            .await
            .map_err(|e| HttpError::BodyError(e.to_string()))?;
        let body_bytes = collected.to_bytes().to_vec();

        if body_bytes.len() > self.config.max_body_size {
            return Err(HttpError::BodyTooLarge {
                size: body_bytes.len(),
                limit: self.config.max_body_size,
            });
        }

        self.bytes_downloaded
            .fetch_add(body_bytes.len() as u64, Ordering::Relaxed);

        debug!(
            "HTTP {} {} -> {} ({} bytes, {:?} TTFB)",
            method,
            url,
            status,
            body_bytes.len(),
            ttfb
        );

        Ok(Response {
            status,
            headers,
            body: body_bytes,
            ttfb,
            total_time: start.elapsed(),
        })
    }

    /// Get client statistics (requests made, bytes downloaded)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.requests_made.load(Ordering::Relaxed),
            self.bytes_downloaded.load(Ordering::Relaxed),
        )
    }
}

/// Run an HTTP/1.1 exchange over an already-connected stream
async fn send_over<S>(
    stream: S,
    request: Request<Full<Bytes>>,
) -> Result<hyper::Response<Incoming>, HttpError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| HttpError::HttpError(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!("Connection error: {}", e);
        }
    });

    sender
        .send_request(request)
        .await
        .map_err(|e| HttpError::HttpError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve a single canned HTTP response on an ephemeral port
    async fn serve_once(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: text/plain\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_client_creation() {
        let client = HttpClient::with_defaults();
        assert_eq!(client.config.timeout, Duration::from_secs(30));
        assert_eq!(client.stats(), (0, 0));
    }

    #[tokio::test]
    async fn test_get_local_server() {
        let base = serve_once("hello tunnel").await;
        let client = HttpClient::with_defaults();

        let response = client.get(&format!("{}/home", base)).await.unwrap();

        assert!(response.is_success());
        assert_eq!(response.text().unwrap(), "hello tunnel");
        assert_eq!(response.content_type(), Some("text/plain"));
        assert_eq!(client.stats(), (1, 12));
    }

    #[tokio::test]
    async fn test_body_limit() {
        let base = serve_once("0123456789").await;
        let client = HttpClient::new(HttpClientConfig {
            max_body_size: 4,
            ..HttpClientConfig::default()
        });

        let result = client.get(&base).await;
        assert!(matches!(
            result,
            Err(HttpError::BodyTooLarge { size: 10, limit: 4 })
        ));
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let client = HttpClient::with_defaults();

        assert!(matches!(
            client.get("not a url").await,
            Err(HttpError::InvalidUrl(_))
        ));
        assert!(matches!(
            client.get("ftp://example.com/file").await,
            Err(HttpError::InvalidUrl(_))
        ));
    }
}
