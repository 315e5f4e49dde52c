use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::protocol::{self, ProtocolError, TransferMetadata};
use crate::config::ShareConfig;

// Constants for file transfer
const DEFAULT_CHUNK_SIZE: usize = 4096;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_MAX_CONCURRENT_SENDS: usize = 4;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Event reported for a single transfer attempt.
///
/// Every attempt produces zero or more `Progress` events followed by exactly
/// one `Success` or `Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// Bytes moved so far, as a truncated percentage of the declared size
    Progress {
        transfer_id: String,
        direction: TransferDirection,
        percent: u8,
    },
    /// All bytes moved
    Success {
        transfer_id: String,
        direction: TransferDirection,
        file_name: String,
        bytes: u64,
    },
    /// The attempt failed; nothing more will be reported for it
    Error {
        transfer_id: String,
        direction: TransferDirection,
        message: String,
    },
}

impl TransferStatus {
    pub fn transfer_id(&self) -> &str {
        match self {
            TransferStatus::Progress { transfer_id, .. }
            | TransferStatus::Success { transfer_id, .. }
            | TransferStatus::Error { transfer_id, .. } => transfer_id,
        }
    }

    pub fn direction(&self) -> TransferDirection {
        match self {
            TransferStatus::Progress { direction, .. }
            | TransferStatus::Success { direction, .. }
            | TransferStatus::Error { direction, .. } => *direction,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransferStatus::Progress { .. })
    }
}

/// Direction of file transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Sending a file
    Send,
    /// Receiving a file
    Receive,
}

/// Observer for transfer events.
///
/// Invoked from background tasks; it must not block for long.
pub type StatusCallback = Arc<dyn Fn(TransferStatus) + Send + Sync>;

/// Configuration for file transfers
#[derive(Clone)]
pub struct FileTransferConfig {
    /// Size of chunks to use for file transfer
    pub chunk_size: usize,
    /// Port to use for file transfer server
    pub port: u16,
    /// Directory to store received files
    pub receive_dir: PathBuf,
    /// How long an outbound connect may take
    pub connect_timeout: Duration,
    /// Leave the truncated destination file behind when a receive fails
    pub keep_partial_files: bool,
    /// Number of outbound transfers allowed to run at once
    pub max_concurrent_sends: usize,
    /// Optional status callback
    pub status_callback: Option<StatusCallback>,
}

impl Default for FileTransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            port: crate::config::DEFAULT_PORT,
            receive_dir: std::env::temp_dir().join("ReceivedFiles"),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keep_partial_files: false,
            max_concurrent_sends: DEFAULT_MAX_CONCURRENT_SENDS,
            status_callback: None,
        }
    }
}

impl FileTransferConfig {
    pub fn from_share_config(share: &ShareConfig, status_callback: Option<StatusCallback>) -> Self {
        Self {
            port: share.port,
            receive_dir: share.receive_dir.clone(),
            keep_partial_files: share.keep_partial_files,
            max_concurrent_sends: share.max_concurrent_sends.max(1),
            status_callback,
            ..Self::default()
        }
    }
}

/// A readable file handed to the engine by the caller
pub struct OpenedSource {
    /// Display name sent to the receiver
    pub name: String,
    /// Exact number of bytes the reader will yield
    pub size: u64,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

/// Resolves an opaque file reference into a byte stream.
#[async_trait]
pub trait FileSource: Send + Sync {
    async fn open(&self) -> Result<OpenedSource>;
}

/// File source backed by a local path
#[derive(Debug, Clone)]
pub struct PathSource {
    path: PathBuf,
}

impl PathSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FileSource for PathSource {
    async fn open(&self) -> Result<OpenedSource> {
        let file = File::open(&self.path)
            .await
            .with_context(|| format!("File not found: {}", self.path.display()))?;
        let size = file
            .metadata()
            .await
            .with_context(|| format!("Failed to get metadata for file {}", self.path.display()))?
            .len();
        let name = self
            .path
            .file_name()
            .ok_or_else(|| anyhow!("Invalid file path: {}", self.path.display()))?
            .to_string_lossy()
            .to_string();

        Ok(OpenedSource {
            name,
            size,
            reader: Box::new(file),
        })
    }
}

/// Handle to a send running in the background
pub struct SendTask {
    pub transfer_id: String,
    handle: JoinHandle<()>,
}

impl SendTask {
    /// Wait until the send has reported its terminal status
    pub async fn wait(self) {
        if let Err(e) = self.handle.await {
            error!("Send task {} did not finish cleanly: {}", self.transfer_id, e);
        }
    }
}

/// Emits events for one attempt; terminal methods take `self` so a second
/// terminal status cannot be produced.
struct StatusReporter {
    transfer_id: String,
    direction: TransferDirection,
    callback: Option<StatusCallback>,
}

impl StatusReporter {
    fn new(direction: TransferDirection, callback: Option<StatusCallback>) -> Self {
        Self {
            transfer_id: Uuid::new_v4().to_string(),
            direction,
            callback,
        }
    }

    fn emit(&self, status: TransferStatus) {
        if let Some(callback) = &self.callback {
            callback(status);
        }
    }

    fn progress(&self, done: u64, total: u64) {
        let percent = protocol::progress_percent(done, total);
        trace!(
            "{:?} {} progress: {}% ({}/{} bytes)",
            self.direction,
            self.transfer_id,
            percent,
            done,
            total
        );
        self.emit(TransferStatus::Progress {
            transfer_id: self.transfer_id.clone(),
            direction: self.direction,
            percent,
        });
    }

    fn success(self, file_name: String, bytes: u64) {
        self.emit(TransferStatus::Success {
            transfer_id: self.transfer_id.clone(),
            direction: self.direction,
            file_name,
            bytes,
        });
    }

    fn error(self, message: String) {
        self.emit(TransferStatus::Error {
            transfer_id: self.transfer_id.clone(),
            direction: self.direction,
            message,
        });
    }
}

/// Outcome of a fully moved file
struct CompletedFile {
    file_name: String,
    bytes: u64,
}

/// File transfer engine: one serial receive loop plus bounded outbound sends
pub struct FileTransferManager {
    config: FileTransferConfig,
    server_address: Arc<Mutex<Option<SocketAddr>>>,
    shutdown_sender: Option<mpsc::Sender<()>>,
    send_permits: Arc<Semaphore>,
}

impl FileTransferManager {
    /// Create a new file transfer manager
    pub fn new(config: FileTransferConfig) -> Self {
        let send_permits = Arc::new(Semaphore::new(config.max_concurrent_sends.max(1)));
        Self {
            config,
            server_address: Arc::new(Mutex::new(None)),
            shutdown_sender: None,
            send_permits,
        }
    }

    /// Start the file transfer server.
    ///
    /// A bind failure is reported once through the status callback and also
    /// returned; the accept loop does not start in that case.
    pub async fn start_server(&mut self) -> Result<SocketAddr> {
        if self.shutdown_sender.is_some() {
            bail!("File transfer server is already running");
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                let message = format!("Server error: failed to bind {}: {}", addr, e);
                error!("{}", message);
                StatusReporter::new(TransferDirection::Receive, self.config.status_callback.clone())
                    .error(message.clone());
                return Err(anyhow!(message));
            }
        };
        let server_addr = listener.local_addr()?;

        // Create a channel to signal shutdown
        let (tx, rx) = mpsc::channel(1);
        self.shutdown_sender = Some(tx);

        {
            let mut addr_guard = self.server_address.lock().await;
            *addr_guard = Some(server_addr);
        }

        info!("File transfer server started on {}", server_addr);

        let config = self.config.clone();
        let server_address = self.server_address.clone();
        tokio::spawn(async move {
            accept_loop(listener, config, rx).await;
            *server_address.lock().await = None;
        });

        Ok(server_addr)
    }

    /// Stop accepting connections.
    ///
    /// The loop exits at its next accept boundary; a receive already in
    /// progress is allowed to finish.
    pub async fn stop_server(&mut self) {
        if let Some(tx) = self.shutdown_sender.take() {
            let _ = tx.send(()).await;
            info!("Sent shutdown signal to file transfer server");
        }
    }

    /// Send one file to `host:port` in the background.
    ///
    /// All outcomes, including failing to open the source, are reported
    /// through the status callback. Sends beyond the configured concurrency
    /// wait for a free slot.
    pub fn send_file<S>(&self, host: impl Into<String>, port: u16, source: S) -> SendTask
    where
        S: FileSource + 'static,
    {
        let host = host.into();
        let config = self.config.clone();
        let permits = self.send_permits.clone();
        let reporter = StatusReporter::new(TransferDirection::Send, config.status_callback.clone());
        let transfer_id = reporter.transfer_id.clone();

        info!("Queued transfer {} to {}:{}", transfer_id, host, port);

        let handle = tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    reporter.error("Send failed: transfer engine is shut down".to_string());
                    return;
                }
            };

            match send_file_to(&host, port, &source, &config, &reporter).await {
                Ok(sent) => {
                    info!(
                        "✅ File sent: {} ({} bytes) to {}:{}",
                        sent.file_name, sent.bytes, host, port
                    );
                    reporter.success(sent.file_name, sent.bytes);
                }
                Err(e) => {
                    let message = format!("Send failed: {:#}", e);
                    error!("{}", message);
                    reporter.error(message);
                }
            }
        });

        SendTask { transfer_id, handle }
    }

    /// Get the address of the file transfer server
    pub async fn server_address(&self) -> Option<SocketAddr> {
        let guard = self.server_address.lock().await;
        *guard
    }

    /// Get the receive directory path
    pub fn receive_directory(&self) -> PathBuf {
        self.config.receive_dir.clone()
    }
}

/// Accept connections one at a time, finishing each transfer before the next accept
async fn accept_loop(
    listener: TcpListener,
    config: FileTransferConfig,
    mut shutdown: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            conn_result = listener.accept() => {
                match conn_result {
                    Ok((socket, addr)) => {
                        info!("New file transfer connection from {}", addr);
                        handle_incoming_file(socket, addr, &config).await;
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }

            _ = shutdown.recv() => {
                info!("Shutting down file transfer server");
                break;
            }
        }
    }
}

/// Receive one file and report its outcome; the socket closes on return
async fn handle_incoming_file(
    mut socket: TcpStream,
    addr: SocketAddr,
    config: &FileTransferConfig,
) {
    let reporter = StatusReporter::new(TransferDirection::Receive, config.status_callback.clone());
    let mut destination = None;

    match receive_file(&mut socket, config, &reporter, &mut destination).await {
        Ok(received) => {
            info!(
                "✅ File received: {} ({} bytes) from {}",
                received.file_name, received.bytes, addr
            );
            reporter.success(received.file_name, received.bytes);
        }
        Err(e) => {
            let message = format!("Receive failed: {:#}", e);
            error!("{} (peer {})", message, addr);
            if let Some(path) = destination {
                discard_partial_file(&path, config.keep_partial_files).await;
            }
            reporter.error(message);

            // Close with a reset so the sender sees the abort even when
            // nothing is left unread
            if let Err(e) = socket.set_linger(Some(Duration::ZERO)) {
                debug!("Failed to set linger on connection from {}: {}", addr, e);
            }
        }
    }
}

async fn receive_file(
    socket: &mut TcpStream,
    config: &FileTransferConfig,
    reporter: &StatusReporter,
    destination: &mut Option<PathBuf>,
) -> Result<CompletedFile> {
    let metadata = protocol::read_header(socket).await?;
    let file_name = metadata.safe_file_name()?.to_string();
    let file_size = metadata.file_size;

    info!("Receiving file: {} ({} bytes)", file_name, file_size);

    fs::create_dir_all(&config.receive_dir).await.with_context(|| {
        format!("Failed to create receive directory {}", config.receive_dir.display())
    })?;

    let file_path = config.receive_dir.join(&file_name);
    let mut file = File::create(&file_path)
        .await
        .with_context(|| format!("Failed to create {}", file_path.display()))?;
    *destination = Some(file_path.clone());
    debug!("Saving file to: {}", file_path.display());

    let mut buffer = vec![0u8; config.chunk_size.max(1)];
    let mut received = 0u64;

    while received < file_size {
        let max_bytes = std::cmp::min(buffer.len() as u64, file_size - received) as usize;
        let n = socket
            .read(&mut buffer[..max_bytes])
            .await
            .context("Failed to read file data")?;

        if n == 0 {
            return Err(ProtocolError::Truncated {
                received,
                expected: file_size,
            }
            .into());
        }

        file.write_all(&buffer[..n])
            .await
            .with_context(|| format!("Failed to write {}", file_path.display()))?;
        received += n as u64;
        reporter.progress(received, file_size);
    }

    file.flush()
        .await
        .with_context(|| format!("Failed to flush {}", file_path.display()))?;

    Ok(CompletedFile {
        file_name,
        bytes: received,
    })
}

async fn discard_partial_file(path: &Path, keep: bool) {
    if keep {
        warn!("Leaving partial file in place: {}", path.display());
        return;
    }
    match fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial file {}", path.display()),
        Err(e) => warn!("Failed to remove partial file {}: {}", path.display(), e),
    }
}

async fn send_file_to(
    host: &str,
    port: u16,
    source: &dyn FileSource,
    config: &FileTransferConfig,
    reporter: &StatusReporter,
) -> Result<CompletedFile> {
    let opened = source.open().await?;
    let metadata = TransferMetadata::new(opened.name, opened.size)?;
    let file_size = metadata.file_size;

    info!(
        "Sending file: {} ({} bytes) to {}:{}",
        metadata.file_name, file_size, host, port
    );

    let mut socket = connect_with_timeout(host, port, config.connect_timeout).await?;
    debug!("Connected to receiver {}:{}", host, port);

    protocol::write_header(&mut socket, &metadata)
        .await
        .context("Failed to send metadata")?;

    let mut reader = opened.reader;
    let mut buffer = vec![0u8; config.chunk_size.max(1)];
    let mut sent = 0u64;

    while sent < file_size {
        let max_bytes = std::cmp::min(buffer.len() as u64, file_size - sent) as usize;
        let n = reader
            .read(&mut buffer[..max_bytes])
            .await
            .context("Failed to read from file source")?;

        if n == 0 {
            bail!("file source ended after {} of {} bytes", sent, file_size);
        }

        socket
            .write_all(&buffer[..n])
            .await
            .context("Failed to send file data")?;
        sent += n as u64;
        reporter.progress(sent, file_size);
    }

    socket.flush().await.context("Failed to send file data")?;
    await_receiver_close(&mut socket, config.connect_timeout).await?;

    Ok(CompletedFile {
        file_name: metadata.file_name,
        bytes: sent,
    })
}

async fn connect_with_timeout(host: &str, port: u16, limit: Duration) -> Result<TcpStream> {
    match tokio::time::timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(socket)) => Ok(socket),
        Ok(Err(e)) => Err(anyhow!(e).context(format!("Failed to connect to {}:{}", host, port))),
        Err(_) => Err(anyhow!(
            "Connection to {}:{} timed out after {:?}",
            host,
            port,
            limit
        )),
    }
}

/// Half-close our side and wait for the receiver to hang up.
///
/// A clean close means every byte was consumed; a reset means the receiver
/// gave up on the transfer.
async fn await_receiver_close(socket: &mut TcpStream, limit: Duration) -> Result<()> {
    socket
        .shutdown()
        .await
        .context("Failed to finish the connection")?;

    let drain = async {
        let mut scratch = [0u8; 64];
        loop {
            match socket.read(&mut scratch).await {
                Ok(0) => return Ok(()),
                Ok(n) => trace!("Ignoring {} unexpected bytes from receiver", n),
                Err(e) => return Err(e),
            }
        }
    };

    match tokio::time::timeout(limit, drain).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(anyhow!(e).context("Receiver aborted the transfer")),
        Err(_) => {
            warn!(
                "Receiver did not close within {:?}; assuming delivery",
                limit
            );
            Ok(())
        }
    }
}
