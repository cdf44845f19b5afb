//! Loopback streaming server
//!
//! Minimal HTTP/1.1 server exposing decrypted file bytes to local media
//! components. Binds to 127.0.0.1:0 (OS-assigned port) and serves:
//!   GET /stream?file={base64url(JSON CloudFileDescriptor)}
//!
//! Security:
//! - Only binds to loopback (127.0.0.1)
//! - Every request carries `Authorization: Bearer {token}`; the token is 32
//!   bytes of OS randomness, fresh per server, compared in constant time
//! - A restarted worker starts a new server, so port and token rotate

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use futures_util::StreamExt;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bridge::ReadyInfo;
use crate::transfer::{chunk_stream, CloudBackend, CloudFileDescriptor};

const TOKEN_LEN: usize = 32;

/// Upper bound on request head lines; anything longer is dropped.
const MAX_HEADER_LINES: usize = 64;

/// Upper bound on one request or header line, terminator included.
const MAX_LINE_BYTES: u64 = 8 * 1024;

/// Generate a bearer token: URL-safe base64 of 32 random bytes.
fn generate_token() -> String {
    let mut data = [0u8; TOKEN_LEN];
    rand::rngs::OsRng.fill_bytes(&mut data);
    URL_SAFE_NO_PAD.encode(data)
}

/// Constant-time token check on the decoded bytes.
fn validate_token(received: &str, expected: &str) -> bool {
    let received = received.trim();
    if received.len() != expected.len() {
        return false;
    }
    let (Ok(received_bytes), Ok(expected_bytes)) = (
        URL_SAFE_NO_PAD.decode(received),
        URL_SAFE_NO_PAD.decode(expected),
    ) else {
        warn!("[Loopback] Token validation failed: invalid Base64");
        return false;
    };
    received_bytes.len() == TOKEN_LEN
        && expected_bytes.len() == TOKEN_LEN
        && bool::from(received_bytes.ct_eq(&expected_bytes))
}

/// Build an HTTP response head.
fn response_head(status: u16, reason: &str, content_type: &str, length: u64) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Cache-Control: no-store\r\n\
         Connection: close\r\n\
         \r\n",
        status, reason, content_type, length
    )
}

fn error_response(status: u16, reason: &str, message: &str) -> Vec<u8> {
    let mut resp = response_head(status, reason, "text/plain", message.len() as u64).into_bytes();
    resp.extend_from_slice(message.as_bytes());
    resp
}

/// Parsed request head.
struct Request {
    method: String,
    target: String,
    authorization: Option<String>,
}

/// Read one line of at most [`MAX_LINE_BYTES`]. `None` on EOF, error or overflow.
async fn read_line_capped<R>(reader: &mut BufReader<R>) -> Option<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    match reader.take(MAX_LINE_BYTES).read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) if !line.ends_with('\n') => {
            debug!("[Loopback] Request line exceeds {} bytes", MAX_LINE_BYTES);
            None
        }
        Ok(_) => Some(line),
    }
}

async fn read_request<R>(reader: &mut BufReader<R>) -> Option<Request>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let request_line = read_line_capped(reader).await?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();

    let mut authorization = None;
    for _ in 0..MAX_HEADER_LINES {
        let line = read_line_capped(reader).await?;
        let line = line.trim();
        if line.is_empty() {
            return Some(Request {
                method,
                target,
                authorization,
            });
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("authorization") {
                authorization = Some(value.trim().to_string());
            }
        }
    }
    None
}

/// Decide what to serve. `Err` carries a complete error response.
fn route(request: &Request, token: &str) -> Result<CloudFileDescriptor, Vec<u8>> {
    if request.method != "GET" {
        return Err(error_response(405, "Method Not Allowed", "Only GET is supported"));
    }

    let authorized = request
        .authorization
        .as_deref()
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|received| validate_token(received, token))
        .unwrap_or(false);
    if !authorized {
        return Err(error_response(401, "Unauthorized", "Invalid or missing token"));
    }

    let (path, query) = request
        .target
        .split_once('?')
        .unwrap_or((request.target.as_str(), ""));
    if path != "/stream" {
        return Err(error_response(404, "Not Found", "Unknown path"));
    }

    let encoded = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "file")
        .map(|(_, value)| value.trim_end_matches('='))
        .ok_or_else(|| error_response(400, "Bad Request", "Missing file parameter"))?;
    let json = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| error_response(400, "Bad Request", "Invalid file encoding"))?;
    serde_json::from_slice(&json)
        .map_err(|_| error_response(400, "Bad Request", "Invalid file descriptor"))
}

/// Handle a single TCP connection: read the request head, route, respond.
async fn handle_connection(stream: TcpStream, backend: Arc<dyn CloudBackend>, token: Arc<str>) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let Some(request) = read_request(&mut reader).await else {
        let _ = writer
            .write_all(&error_response(400, "Bad Request", "Malformed request"))
            .await;
        let _ = writer.shutdown().await;
        return;
    };

    let file = match route(&request, &token) {
        Ok(file) => file,
        Err(response) => {
            let _ = writer.write_all(&response).await;
            let _ = writer.shutdown().await;
            return;
        }
    };

    debug!("[Loopback] Streaming {} ({} bytes)", file.uuid, file.size);
    let head = response_head(200, "OK", "application/octet-stream", file.size);
    if writer.write_all(head.as_bytes()).await.is_err() {
        return;
    }

    let uuid = file.uuid.clone();
    let mut chunks = chunk_stream(backend, file);
    while let Some(chunk) = chunks.next().await {
        let result = match chunk {
            Ok(bytes) => writer.write_all(&bytes).await,
            Err(e) => {
                // Status is already sent; a short body tells the client
                warn!("[Loopback] Stream of {} failed: {}", uuid, e);
                break;
            }
        };
        if let Err(e) = result {
            debug!("[Loopback] Client went away during {}: {}", uuid, e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Running loopback server. Stops when [`LoopbackServer::shutdown`] is called or on drop.
pub struct LoopbackServer {
    info: ReadyInfo,
    shutdown_tx: watch::Sender<bool>,
}

impl LoopbackServer {
    /// Bind to loopback with an OS-assigned port and a fresh token.
    pub async fn start(backend: Arc<dyn CloudBackend>) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let token: Arc<str> = Arc::from(generate_token());

        info!("[Loopback] Started on 127.0.0.1:{}", port);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let accept_token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _addr)) => {
                                tokio::spawn(handle_connection(
                                    stream,
                                    backend.clone(),
                                    accept_token.clone(),
                                ));
                            }
                            Err(e) => {
                                warn!("[Loopback] Accept error: {}", e);
                            }
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("[Loopback] Shutting down");
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            info: ReadyInfo {
                port,
                token: token.to_string(),
            },
            shutdown_tx,
        })
    }

    /// Port and token to publish in the `ready` handshake.
    pub fn info(&self) -> ReadyInfo {
        self.info.clone()
    }

    pub fn port(&self) -> u16 {
        self.info.port
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl Drop for LoopbackServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::backend::testing::MemoryBackend;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    async fn get(port: u16, request: String) -> (u16, Vec<u8>) {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();

        let split = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("response head");
        let head = String::from_utf8_lossy(&raw[..split]).to_string();
        let status = head
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap();
        (status, raw[split + 4..].to_vec())
    }

    fn request(method: &str, target: &str, auth: Option<&str>) -> String {
        let mut req = format!("{} {} HTTP/1.1\r\nHost: 127.0.0.1\r\n", method, target);
        if let Some(auth) = auth {
            req.push_str(&format!("Authorization: {}\r\n", auth));
        }
        req.push_str("\r\n");
        req
    }

    fn target(info: &ReadyInfo, file: &CloudFileDescriptor) -> String {
        let url = info.stream_url(file).unwrap();
        let prefix = format!("http://127.0.0.1:{}", info.port);
        url.strip_prefix(&prefix).unwrap().to_string()
    }

    #[tokio::test]
    async fn test_streams_file_with_valid_token() {
        let backend = MemoryBackend::new();
        let content: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let file = backend.add_file("video.mp4", &content, 1024);
        let server = LoopbackServer::start(backend.clone()).await.unwrap();
        let info = server.info();

        let (status, body) = get(
            info.port,
            request("GET", &target(&info, &file), Some(&info.authorization_header())),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body, content);
        assert_eq!(backend.reads(), 5);
    }

    #[tokio::test]
    async fn test_empty_file_needs_no_reads() {
        let backend = MemoryBackend::new();
        let file = backend.add_file("empty", b"", 16);
        let server = LoopbackServer::start(backend.clone()).await.unwrap();
        let info = server.info();

        let (status, body) = get(
            info.port,
            request("GET", &target(&info, &file), Some(&info.authorization_header())),
        )
        .await;
        assert_eq!(status, 200);
        assert!(body.is_empty());
        assert_eq!(backend.reads(), 0);
    }

    #[tokio::test]
    async fn test_rejections() {
        let backend = MemoryBackend::new();
        let file = backend.add_file("a", b"abc", 2);
        let server = LoopbackServer::start(backend.clone()).await.unwrap();
        let info = server.info();
        let auth = info.authorization_header();
        let good = target(&info, &file);

        let (status, _) = get(info.port, request("GET", &good, None)).await;
        assert_eq!(status, 401);
        let (status, _) = get(info.port, request("GET", &good, Some("Bearer nope"))).await;
        assert_eq!(status, 401);
        let (status, _) = get(info.port, request("POST", &good, Some(&auth))).await;
        assert_eq!(status, 405);
        let (status, _) = get(info.port, request("GET", "/other", Some(&auth))).await;
        assert_eq!(status, 404);
        let (status, _) = get(info.port, request("GET", "/stream?file=%%%", Some(&auth))).await;
        assert_eq!(status, 400);
        let bogus = URL_SAFE_NO_PAD.encode(b"{\"not\":\"a descriptor\"}");
        let (status, _) = get(
            info.port,
            request("GET", &format!("/stream?file={}", bogus), Some(&auth)),
        )
        .await;
        assert_eq!(status, 400);

        assert_eq!(backend.reads(), 0);
    }

    #[tokio::test]
    async fn test_restart_rotates_port_and_token() {
        let backend = MemoryBackend::new();
        let first = LoopbackServer::start(backend.clone()).await.unwrap();
        let second = LoopbackServer::start(backend.clone()).await.unwrap();
        assert_ne!(first.info().token, second.info().token);
        assert_ne!(first.port(), second.port());

        // A token from one server does not open the other
        let file = backend.add_file("a", b"abc", 2);
        let stale = first.info();
        let (status, _) = get(
            second.port(),
            request("GET", &target(&second.info(), &file), Some(&stale.authorization_header())),
        )
        .await;
        assert_eq!(status, 401);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let server = LoopbackServer::start(MemoryBackend::new()).await.unwrap();
        let port = server.port();
        server.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn test_request_head_parsing() {
        let raw = b"GET /stream?file=abc HTTP/1.1\r\nHost: x\r\nauthorization: Bearer t\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let request = read_request(&mut reader).await.unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.target, "/stream?file=abc");
        assert_eq!(request.authorization.as_deref(), Some("Bearer t"));

        // Head cut off before the blank line
        let mut reader = BufReader::new(&b"GET / HTTP/1.1\r\nHost: x\r\n"[..]);
        assert!(read_request(&mut reader).await.is_none());
    }

    #[tokio::test]
    async fn test_oversized_lines_are_refused_without_buffering_them() {
        let huge = "a".repeat(MAX_LINE_BYTES as usize * 4);

        let header = format!("GET /stream HTTP/1.1\r\nX-Filler: {}\r\n\r\n", huge);
        let mut reader = BufReader::new(header.as_bytes());
        assert!(read_request(&mut reader).await.is_none());
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert!(rest.len() > huge.len() / 2);

        let request_line = format!("GET /{} HTTP/1.1\r\n\r\n", huge);
        let mut reader = BufReader::new(request_line.as_bytes());
        assert!(read_request(&mut reader).await.is_none());
    }

    #[test]
    fn test_token_validation() {
        let token = generate_token();
        assert_eq!(token.len(), 43);
        assert!(validate_token(&token, &token));
        assert!(validate_token(&format!(" {} ", token), &token));
        assert!(!validate_token(&generate_token(), &token));
        assert!(!validate_token("short", &token));
    }
}
