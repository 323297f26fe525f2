//! IPC Server - Unix socket server for host processes
//!
//! Accepts newline-delimited JSON commands and dispatches them to the
//! CacheService. Every cache call goes through the deadline-bounded variants
//! so a stalled disk cannot wedge a connection.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use crate::ipc::protocol::{
    decode_payload, parse_command, serialize_response, Command, Response, MAX_LINE_BYTES,
    PROTOCOL_VERSION,
};
use crate::store::Category;
use crate::service::CacheService;

/// IPC Server that listens for commands from host processes
pub struct IpcServer {
    /// Cache handle shared with every connection
    service: CacheService,
    /// Where the socket is bound
    socket_path: PathBuf,
    /// Socket listener
    listener: Option<UnixListener>,
    /// Longest accepted command line
    max_line_bytes: usize,
    /// Active connections, for logging
    connection_count: Arc<AtomicU32>,
}

impl IpcServer {
    /// Create a new IPC server
    pub fn new(service: CacheService, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            service,
            socket_path: socket_path.into(),
            listener: None,
            max_line_bytes: MAX_LINE_BYTES,
            connection_count: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Reject command lines longer than `limit` bytes
    pub fn with_max_line_bytes(mut self, limit: usize) -> Self {
        self.max_line_bytes = limit;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Start the IPC server
    pub async fn start(&mut self) -> Result<()> {
        // Clean up any existing socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("Failed to remove existing socket file")?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind Unix socket {:?}", self.socket_path))?;

        info!(socket_path = %self.socket_path.display(), "IPC server started");

        self.listener = Some(listener);
        Ok(())
    }

    /// Run the server loop, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("Server not started")?;

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let service = self.service.clone();
                    let max_line_bytes = self.max_line_bytes;
                    let connection_count = Arc::clone(&self.connection_count);

                    // Spawn a new task to handle this connection
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, service, max_line_bytes, connection_count)
                                .await
                        {
                            error!(error = %e, "Connection handler error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Stop the IPC server and clean up
    pub async fn stop(&self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).context("Failed to remove socket file")?;
        }
        info!("IPC server stopped");
        Ok(())
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: UnixStream,
    service: CacheService,
    max_line_bytes: usize,
    connection_count: Arc<AtomicU32>,
) -> Result<()> {
    let count = connection_count.fetch_add(1, Ordering::Relaxed) + 1;
    debug!(count = count, "New connection");

    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = Vec::new();

    // Read commands line by line (newline-delimited JSON)
    loop {
        line.clear();
        let read = (&mut buf_reader)
            .take(max_line_bytes as u64 + 1)
            .read_until(b'\n', &mut line)
            .await;

        match read {
            Ok(0) => {
                debug!("Connection closed by client");
                break;
            }
            Ok(_) => {
                let response = if !line.ends_with(b"\n") && line.len() > max_line_bytes {
                    warn!(limit = max_line_bytes, "Command line too long, discarding");
                    if let Err(e) = discard_line(&mut buf_reader).await {
                        error!(error = %e, "Failed to read from socket");
                        break;
                    }
                    Response::Error {
                        error: format!("Command exceeds {} bytes", max_line_bytes),
                    }
                } else if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                } else {
                    match parse_command(&line) {
                        Ok(command) => process_command(command, &service).await,
                        Err(e) => {
                            error!(error = %e, "Failed to parse command");
                            Response::Error {
                                error: format!("Invalid command: {}", e),
                            }
                        }
                    }
                };

                match serialize_response(&response) {
                    Ok(json) => {
                        if let Err(e) = writer.write_all(&json).await {
                            error!(error = %e, "Failed to write response");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to serialize response");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to read from socket");
                break;
            }
        }
    }

    let count = connection_count.fetch_sub(1, Ordering::Relaxed) - 1;
    debug!(count = count, "Connection ended");

    Ok(())
}

/// Skip the rest of an over-long line, up to and including its newline
async fn discard_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<()> {
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(());
        }
        match buf.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(());
            }
            None => {
                let len = buf.len();
                reader.consume(len);
            }
        }
    }
}

/// Process a command and return a response
async fn process_command(command: Command, service: &CacheService) -> Response {
    match command {
        Command::Store {
            category,
            key,
            payload,
        } => {
            debug!(category = %category, key = %key, "Processing store command");
            match decode_payload(&payload) {
                Ok(bytes) => {
                    match category {
                        Category::Image => service.cache_image_bounded(key, bytes).await,
                        other => service.store_bounded(bytes, key, other).await,
                    }
                    Response::Success { message: None }
                }
                Err(e) => invalid_payload(e),
            }
        }

        // Image keys always go through the hashed tier
        Command::Retrieve { category, key } => {
            debug!(category = %category, key = %key, "Processing retrieve command");
            Response::from_lookup(match category {
                Category::Image => service.retrieve_image_bounded(key).await,
                other => service.retrieve_bounded(key, other).await,
            })
        }

        Command::Remove { category, key } => {
            debug!(category = %category, key = %key, "Processing remove command");
            match category {
                Category::Image => service.remove_image_bounded(key).await,
                other => service.remove_bounded(key, other).await,
            }
            Response::Success { message: None }
        }

        Command::Clear { category } => {
            info!(category = %category, "Processing clear command");
            service.clear_bounded(category).await;
            Response::Success {
                message: Some(format!("Cleared {}", category)),
            }
        }

        Command::CacheImage { key, payload } => {
            debug!(key = %key, "Processing cacheImage command");
            match decode_payload(&payload) {
                Ok(bytes) => {
                    service.cache_image_bounded(key, bytes).await;
                    Response::Success { message: None }
                }
                Err(e) => invalid_payload(e),
            }
        }

        Command::RetrieveImage { key } => {
            debug!(key = %key, "Processing retrieveImage command");
            Response::from_lookup(service.retrieve_image_bounded(key).await)
        }

        Command::ClearImageCache => {
            info!("Processing clearImageCache command");
            service.clear_image_cache_bounded().await;
            Response::Success {
                message: Some("Cleared image cache".to_string()),
            }
        }

        Command::TotalSize => Response::Size {
            bytes: service.total_disk_size_bounded().await,
        },

        Command::SetCachingEnabled { enabled } => {
            service.set_caching_enabled(enabled);
            Response::Success {
                message: Some(format!(
                    "Caching {}",
                    if enabled { "enabled" } else { "disabled" }
                )),
            }
        }

        Command::MemoryPressure => {
            service.handle_memory_pressure_bounded().await;
            Response::Success {
                message: Some("Caches cleared".to_string()),
            }
        }

        Command::GetStatus => {
            debug!("Processing getStatus command");
            match service.status_bounded().await {
                Some(cache) => Response::Status {
                    version: PROTOCOL_VERSION,
                    healthy: true,
                    cache,
                },
                None => Response::Error {
                    error: "Status unavailable: cache storage did not respond in time".to_string(),
                },
            }
        }
    }
}

fn invalid_payload(e: base64::DecodeError) -> Response {
    Response::Error {
        error: format!("Invalid payload: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::ipc::protocol::encode_payload;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    async fn send(
        reader: &mut BufReader<tokio::net::unix::OwnedReadHalf>,
        writer: &mut tokio::net::unix::OwnedWriteHalf,
        line: &str,
    ) -> Response {
        writer.write_all(line.as_bytes()).await.unwrap();
        writer.write_all(b"\n").await.unwrap();
        let mut reply = String::new();
        reader.read_line(&mut reply).await.unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let service = CacheService::new(&CacheConfig::with_root(dir.path().join("cache")));
        let socket_path = dir.path().join("tiercache.sock");

        let mut server = IpcServer::new(service, &socket_path);
        server.start().await.unwrap();
        let server_task = tokio::spawn(async move { server.run().await });

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let store = format!(
            r#"{{"type":"store","category":"data","key":"readme","payload":"{}"}}"#,
            encode_payload(b"hello world")
        );
        assert!(matches!(
            send(&mut reader, &mut writer, &store).await,
            Response::Success { .. }
        ));

        match send(&mut reader, &mut writer, r#"{"type":"retrieve","category":"data","key":"readme"}"#).await {
            Response::Payload {
                found: true,
                payload: Some(payload),
            } => assert_eq!(decode_payload(&payload).unwrap(), b"hello world"),
            other => panic!("Expected payload, got {:?}", other),
        }

        match send(&mut reader, &mut writer, r#"{"type":"retrieve","category":"api","key":"readme"}"#).await {
            Response::Payload { found, .. } => assert!(!found),
            other => panic!("Expected payload, got {:?}", other),
        }

        match send(&mut reader, &mut writer, r#"{"type":"totalSize"}"#).await {
            Response::Size { bytes } => assert!(bytes >= 11),
            other => panic!("Expected size, got {:?}", other),
        }

        // Garbage gets an error and the connection stays usable
        assert!(matches!(
            send(&mut reader, &mut writer, "not json").await,
            Response::Error { .. }
        ));
        assert!(matches!(
            send(&mut reader, &mut writer, r#"{"type":"store","category":"data","key":"k","payload":"%%%"}"#).await,
            Response::Error { .. }
        ));

        assert!(matches!(
            send(&mut reader, &mut writer, r#"{"type":"memoryPressure"}"#).await,
            Response::Success { .. }
        ));
        match send(&mut reader, &mut writer, r#"{"type":"getStatus"}"#).await {
            Response::Status {
                version,
                healthy,
                cache,
            } => {
                assert_eq!(version, PROTOCOL_VERSION);
                assert!(healthy);
                assert_eq!(cache.disk_bytes, 0);
                assert!(cache.caching_enabled);
            }
            other => panic!("Expected status, got {:?}", other),
        }

        server_task.abort();
    }

    #[tokio::test]
    async fn test_image_commands_and_toggle() {
        let dir = tempfile::tempdir().unwrap();
        let service = CacheService::new(&CacheConfig::with_root(dir.path().join("cache")));
        let socket_path = dir.path().join("tiercache.sock");

        let mut server = IpcServer::new(service.clone(), &socket_path);
        server.start().await.unwrap();
        let server_task = tokio::spawn(async move { server.run().await });

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let cache_image = format!(
            r#"{{"type":"cacheImage","key":"https://example.com/a.png","payload":"{}"}}"#,
            encode_payload(b"png")
        );
        send(&mut reader, &mut writer, &cache_image).await;
        assert!(service.image_cache().in_memory("https://example.com/a.png"));

        send(&mut reader, &mut writer, r#"{"type":"setCachingEnabled","enabled":false}"#).await;
        assert!(!service.caching_enabled());
        match send(&mut reader, &mut writer, r#"{"type":"retrieveImage","key":"https://example.com/a.png"}"#).await {
            Response::Payload { found, .. } => assert!(!found),
            other => panic!("Expected payload, got {:?}", other),
        }

        send(&mut reader, &mut writer, r#"{"type":"setCachingEnabled","enabled":true}"#).await;
        send(&mut reader, &mut writer, r#"{"type":"clearImageCache"}"#).await;
        assert_eq!(service.retrieve_image("https://example.com/a.png"), None);

        server_task.abort();
    }

    #[tokio::test]
    async fn test_image_category_commands_use_hashed_keys() {
        let dir = tempfile::tempdir().unwrap();
        let service = CacheService::new(&CacheConfig::with_root(dir.path().join("cache")));
        let socket_path = dir.path().join("tiercache.sock");

        let mut server = IpcServer::new(service.clone(), &socket_path);
        server.start().await.unwrap();
        let server_task = tokio::spawn(async move { server.run().await });

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let store = format!(
            r#"{{"type":"store","category":"image","key":"https://example.com/a.png","payload":"{}"}}"#,
            encode_payload(b"png")
        );
        send(&mut reader, &mut writer, &store).await;
        assert_eq!(
            service.retrieve_image("https://example.com/a.png"),
            Some(b"png".to_vec())
        );

        send(&mut reader, &mut writer, r#"{"type":"remove","category":"image","key":"https://example.com/a.png"}"#).await;
        assert!(!service.image_cache().in_memory("https://example.com/a.png"));
        match send(&mut reader, &mut writer, r#"{"type":"retrieve","category":"image","key":"https://example.com/a.png"}"#).await {
            Response::Payload { found, .. } => assert!(!found),
            other => panic!("Expected payload, got {:?}", other),
        }
        assert_eq!(service.category_disk_size(Category::Image), 0);

        server_task.abort();
    }

    #[tokio::test]
    async fn test_over_long_line_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = CacheService::new(&CacheConfig::with_root(dir.path().join("cache")));
        let socket_path = dir.path().join("tiercache.sock");

        let mut server = IpcServer::new(service, &socket_path).with_max_line_bytes(64);
        server.start().await.unwrap();
        let server_task = tokio::spawn(async move { server.run().await });

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let oversized = format!(r#"{{"type":"retrieve","category":"data","key":"{}"}}"#, "x".repeat(500));
        match send(&mut reader, &mut writer, &oversized).await {
            Response::Error { error } => assert!(error.contains("64")),
            other => panic!("Expected error, got {:?}", other),
        }

        // The rest of the long line was skipped; the next command parses
        assert!(matches!(
            send(&mut reader, &mut writer, r#"{"type":"totalSize"}"#).await,
            Response::Size { .. }
        ));

        server_task.abort();
    }
}
