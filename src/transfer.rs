use crate::acquire::DownloadTicket;
use crate::config::Config;
use crate::error::{AppdownError, Result};
use crate::protocol::StoreHttp;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Waiting,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Waiting, Downloading | Failed | Cancelled)
                | (Downloading, Paused | Completed | Failed | Cancelled)
                | (Paused, Downloading | Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Eta {
    Calculating,
    Remaining(Duration),
}

/// Snapshot of a transfer. Only the transfer task produces these.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferState {
    pub transferred: u64,
    pub total: Option<u64>,
    /// Bytes per second since the previous update
    pub speed: f64,
    pub eta: Eta,
    pub status: TransferStatus,
    /// Set on `Failed` when starting again may succeed
    pub retryable: bool,
}

impl TransferState {
    fn new() -> Self {
        Self {
            transferred: 0,
            total: None,
            speed: 0.0,
            eta: Eta::Calculating,
            status: TransferStatus::Waiting,
            retryable: false,
        }
    }

    fn transition(&mut self, next: TransferStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            tracing::debug!(from = ?self.status, to = ?next, "ignored transfer state change");
            false
        }
    }
}

/// A response body positioned at some offset of the artifact.
pub struct SourceBody {
    /// The source honoured the requested offset
    pub resumed: bool,
    /// Bytes remaining in this body, when known
    pub length: Option<u64>,
    pub stream: BoxStream<'static, Result<Bytes>>,
}

/// Where artifact bytes come from.
pub trait ByteSource: Send + Sync + 'static {
    /// Open the artifact at `url`, starting at byte `offset`. A source that
    /// cannot seek returns the whole body with `resumed == false`.
    fn open(&self, url: &str, offset: u64) -> impl Future<Output = Result<SourceBody>> + Send;
}

pub struct HttpByteSource {
    client: reqwest::Client,
}

impl HttpByteSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl ByteSource for HttpByteSource {
    async fn open(&self, url: &str, offset: u64) -> Result<SourceBody> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", offset));
        }
        let response = request.send().await?;
        let status = response.status();
        if offset > 0 && status == reqwest::StatusCode::RANGE_NOT_SATISFIABLE {
            return match unsatisfied_range_total(response.headers()) {
                Some(total) if total != offset => Err(AppdownError::HttpStatus {
                    status: status.as_u16(),
                    endpoint: "artifact".to_string(),
                }),
                _ => Ok(SourceBody {
                    resumed: true,
                    length: Some(0),
                    stream: futures_util::stream::empty::<Result<Bytes>>().boxed(),
                }),
            };
        }
        if matches!(status.as_u16(), 403 | 404 | 410) {
            return Err(AppdownError::ArtifactNotFound(format!(
                "download URL rejected with HTTP {}, acquire a new ticket",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(AppdownError::HttpStatus {
                status: status.as_u16(),
                endpoint: "artifact".to_string(),
            });
        }
        let resumed = offset > 0 && status == reqwest::StatusCode::PARTIAL_CONTENT;
        let length = response.content_length();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(AppdownError::from))
            .boxed();
        Ok(SourceBody {
            resumed,
            length,
            stream,
        })
    }
}

/// Total length from a `Content-Range: bytes */<total>` reply.
fn unsatisfied_range_total(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let value = headers.get(reqwest::header::CONTENT_RANGE)?.to_str().ok()?;
    value.trim().strip_prefix("bytes */")?.trim().parse().ok()
}

#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Write buffer size; bytes reach the file in chunks of this size
    pub chunk_size: usize,
    pub progress_interval: Duration,
    pub idle_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl TransferSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_size: config.chunk_size,
            progress_interval: Duration::from_millis(config.progress_interval_ms),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs.max(1)),
            max_retries: config.transfer_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: 256 * 1024,
            progress_interval: Duration::from_millis(100),
            idle_timeout: Duration::from_secs(60),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// Exponential backoff: `base * 2^retry`.
pub fn retry_delay(retry: u32, base: Duration) -> Duration {
    base.saturating_mul(2_u32.saturating_pow(retry))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Continue,
    Pause,
    Cancel,
}

#[derive(Debug, Clone)]
pub struct TransferReport {
    pub path: PathBuf,
    pub bytes: u64,
    pub elapsed: Duration,
}

/// Control side of a running transfer.
pub struct TransferHandle {
    control: watch::Sender<Control>,
    state: watch::Receiver<TransferState>,
    task: JoinHandle<Result<TransferReport>>,
}

impl TransferHandle {
    /// Drop the connection and hold the bytes received so far.
    /// Returns false once the transfer has finished.
    pub fn pause(&self) -> bool {
        self.signal(Control::Pause)
    }

    /// Reconnect from the current offset.
    pub fn resume(&self) -> bool {
        self.signal(Control::Continue)
    }

    /// Stop and remove the partial file.
    pub fn cancel(&self) -> bool {
        self.signal(Control::Cancel)
    }

    pub fn state(&self) -> TransferState {
        self.state.borrow().clone()
    }

    pub async fn wait(self) -> Result<TransferReport> {
        self.task
            .await
            .map_err(|e| AppdownError::Io(std::io::Error::other(e.to_string())))?
    }

    fn signal(&self, control: Control) -> bool {
        if self.state.borrow().status.is_terminal() {
            return false;
        }
        self.control.send_replace(control);
        true
    }
}

/// Streams artifacts to disk, one task per transfer.
pub struct TransferEngine<S: ByteSource = HttpByteSource> {
    source: Arc<S>,
    settings: TransferSettings,
}

impl TransferEngine<HttpByteSource> {
    pub fn from_http(http: &StoreHttp) -> Self {
        Self::new(
            HttpByteSource::new(http.bulk_client()),
            TransferSettings::from_config(http.config()),
        )
    }
}

impl<S: ByteSource> TransferEngine<S> {
    pub fn new(source: S, settings: TransferSettings) -> Self {
        Self {
            source: Arc::new(source),
            settings,
        }
    }

    /// Start fetching the ticket's artifact into `destination`. Updates arrive
    /// on `progress` about every `progress_interval`, plus one on every status
    /// change; the final one always reports the full byte count.
    pub fn start(
        &self,
        ticket: &DownloadTicket,
        destination: impl Into<PathBuf>,
        progress: mpsc::UnboundedSender<TransferState>,
    ) -> TransferHandle {
        self.start_url(&ticket.url, destination, progress)
    }

    pub fn start_url(
        &self,
        url: &str,
        destination: impl Into<PathBuf>,
        progress: mpsc::UnboundedSender<TransferState>,
    ) -> TransferHandle {
        let (control_tx, control_rx) = watch::channel(Control::Continue);
        let (state_tx, state_rx) = watch::channel(TransferState::new());
        let task = Transfer {
            source: self.source.clone(),
            url: url.to_string(),
            path: destination.into(),
            settings: self.settings.clone(),
            control: control_rx,
            detached: false,
            progress,
            snapshot: state_tx,
            state: TransferState::new(),
            last_emit: Instant::now(),
            last_emit_bytes: 0,
        };
        TransferHandle {
            control: control_tx,
            state: state_rx,
            task: tokio::spawn(task.run()),
        }
    }
}

enum Pump {
    Finished,
    Paused,
    Cancelled,
    Error(AppdownError),
}

enum Gate {
    Go,
    Cancel,
}

struct Transfer<S> {
    source: Arc<S>,
    url: String,
    path: PathBuf,
    settings: TransferSettings,
    control: watch::Receiver<Control>,
    /// The handle was dropped; nobody can pause or cancel any more
    detached: bool,
    progress: mpsc::UnboundedSender<TransferState>,
    snapshot: watch::Sender<TransferState>,
    state: TransferState,
    last_emit: Instant,
    last_emit_bytes: u64,
}

impl<S: ByteSource> Transfer<S> {
    async fn run(mut self) -> Result<TransferReport> {
        let started = Instant::now();
        self.emit(true);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return self.fail(e.into());
            }
        }
        if let Err(e) = tokio::fs::File::create(&self.path).await {
            return self.fail(e.into());
        }

        let mut offset = 0u64;
        let mut retries = 0u32;
        loop {
            if let Gate::Cancel = self.gate().await {
                return self.cancelled().await;
            }
            if self.state.status != TransferStatus::Downloading
                && self.state.transition(TransferStatus::Downloading)
            {
                self.emit(true);
            }

            let before = offset;
            match self.pump(&mut offset).await {
                Pump::Finished => return Ok(self.complete(started)),
                Pump::Paused => {
                    if self.state.transition(TransferStatus::Paused) {
                        tracing::info!(bytes = offset, "transfer paused");
                        self.emit(true);
                    }
                }
                Pump::Cancelled => return self.cancelled().await,
                Pump::Error(e) => {
                    if offset > before {
                        retries = 0;
                    }
                    if !e.is_retryable() {
                        return self.fail(e);
                    }
                    if retries >= self.settings.max_retries {
                        let e = AppdownError::TransferInterrupted {
                            transferred: offset,
                            reason: e.to_string(),
                        };
                        return self.fail(e);
                    }
                    let delay = retry_delay(retries, self.settings.retry_base_delay);
                    retries += 1;
                    tracing::warn!(error = %e, retry = retries, ?delay, "transfer interrupted, reconnecting");
                    if let Gate::Cancel = self.backoff(delay).await {
                        return self.cancelled().await;
                    }
                }
            }
        }
    }

    /// Wait while paused. Returns `Cancel` if cancelled, or if paused with no
    /// handle left to resume.
    async fn gate(&mut self) -> Gate {
        loop {
            let control = *self.control.borrow_and_update();
            match control {
                Control::Continue => return Gate::Go,
                Control::Cancel => return Gate::Cancel,
                Control::Pause => {
                    if self.detached || self.control.changed().await.is_err() {
                        return Gate::Cancel;
                    }
                }
            }
        }
    }

    async fn backoff(&mut self, delay: Duration) -> Gate {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Gate::Go,
                changed = self.control.changed(), if !self.detached => {
                    if changed.is_err() {
                        self.detached = true;
                    } else if *self.control.borrow() == Control::Cancel {
                        return Gate::Cancel;
                    }
                }
            }
        }
    }

    async fn pump(&mut self, offset: &mut u64) -> Pump {
        let body = match self.open(*offset).await {
            Ok(body) => body,
            Err(pump) => return pump,
        };
        if *offset > 0 && !body.resumed {
            tracing::info!(offset = *offset, "source ignored range request, restarting");
            *offset = 0;
            self.state.transferred = 0;
            self.last_emit_bytes = 0;
        }
        if let Some(length) = body.length {
            self.state.total = Some(length + *offset);
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).write(true);
        if *offset > 0 {
            options.append(true);
        } else {
            options.truncate(true);
        }
        let file = match options.open(&self.path).await {
            Ok(file) => file,
            Err(e) => return Pump::Error(e.into()),
        };
        let mut writer = BufWriter::with_capacity(self.settings.chunk_size, file);
        let mut stream = body.stream;
        let idle = self.settings.idle_timeout;

        loop {
            tokio::select! {
                biased;
                changed = self.control.changed(), if !self.detached => {
                    if changed.is_err() {
                        self.detached = true;
                        continue;
                    }
                    let control = *self.control.borrow_and_update();
                    match control {
                        Control::Continue => {}
                        Control::Pause => {
                            if let Err(e) = writer.flush().await {
                                return Pump::Error(e.into());
                            }
                            return Pump::Paused;
                        }
                        Control::Cancel => return Pump::Cancelled,
                    }
                }
                next = tokio::time::timeout(idle, stream.next()) => {
                    let chunk = match next {
                        Ok(Some(Ok(chunk))) => chunk,
                        Ok(Some(Err(e))) => {
                            return self.interrupted(&mut writer, *offset, e.to_string()).await;
                        }
                        Err(_) => {
                            let reason = format!("no data for {:?}", idle);
                            return self.interrupted(&mut writer, *offset, reason).await;
                        }
                        Ok(None) => {
                            if let Err(e) = writer.flush().await {
                                return Pump::Error(e.into());
                            }
                            return match self.state.total {
                                Some(total) if *offset < total => Pump::Error(
                                    AppdownError::TransferInterrupted {
                                        transferred: *offset,
                                        reason: format!("connection closed at {} of {} bytes", offset, total),
                                    },
                                ),
                                _ => Pump::Finished,
                            };
                        }
                    };
                    if let Err(e) = writer.write_all(&chunk).await {
                        return Pump::Error(e.into());
                    }
                    *offset += chunk.len() as u64;
                    self.state.transferred = *offset;
                    self.emit(false);
                }
            }
        }
    }

    /// Open the source at `offset`, watching for pause and cancel until the
    /// response arrives. Waiting longer than `idle_timeout` is an interruption.
    async fn open(&mut self, offset: u64) -> std::result::Result<SourceBody, Pump> {
        let source = self.source.clone();
        let url = self.url.clone();
        let idle = self.settings.idle_timeout;
        let opening = tokio::time::timeout(idle, source.open(&url, offset));
        tokio::pin!(opening);

        loop {
            tokio::select! {
                biased;
                changed = self.control.changed(), if !self.detached => {
                    if changed.is_err() {
                        self.detached = true;
                        continue;
                    }
                    let control = *self.control.borrow_and_update();
                    match control {
                        Control::Continue => {}
                        Control::Pause => return Err(Pump::Paused),
                        Control::Cancel => return Err(Pump::Cancelled),
                    }
                }
                opened = &mut opening => {
                    return match opened {
                        Ok(Ok(body)) => Ok(body),
                        Ok(Err(e)) => Err(Pump::Error(e)),
                        Err(_) => Err(Pump::Error(AppdownError::TransferInterrupted {
                            transferred: offset,
                            reason: format!("no response for {:?}", idle),
                        })),
                    };
                }
            }
        }
    }

    async fn interrupted(
        &mut self,
        writer: &mut BufWriter<tokio::fs::File>,
        offset: u64,
        reason: String,
    ) -> Pump {
        if let Err(e) = writer.flush().await {
            return Pump::Error(e.into());
        }
        Pump::Error(AppdownError::TransferInterrupted {
            transferred: offset,
            reason,
        })
    }

    fn complete(&mut self, started: Instant) -> TransferReport {
        let bytes = self.state.transferred;
        if self.state.total.map_or(true, |t| t < bytes) {
            self.state.total = Some(bytes);
        }
        self.state.transition(TransferStatus::Completed);
        self.emit(true);
        tracing::info!(bytes, path = %self.path.display(), "transfer complete");
        TransferReport {
            path: self.path.clone(),
            bytes,
            elapsed: started.elapsed(),
        }
    }

    fn fail(&mut self, error: AppdownError) -> Result<TransferReport> {
        let error = match error {
            e @ (AppdownError::Network(_) | AppdownError::Timeout(_)) => {
                AppdownError::TransferInterrupted {
                    transferred: self.state.transferred,
                    reason: e.to_string(),
                }
            }
            e => e,
        };
        self.state.retryable = error.is_retryable();
        self.state.transition(TransferStatus::Failed);
        self.emit(true);
        tracing::warn!(error = %error, retryable = self.state.retryable, "transfer failed");
        Err(error)
    }

    async fn cancelled(&mut self) -> Result<TransferReport> {
        self.state.transition(TransferStatus::Cancelled);
        self.emit(true);
        remove_partial(&self.path).await;
        tracing::info!(path = %self.path.display(), "transfer cancelled");
        Err(AppdownError::Cancelled)
    }

    /// Recompute speed and ETA and send an update. Unforced calls are dropped
    /// until `progress_interval` has passed since the previous update.
    fn emit(&mut self, force: bool) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_emit);
        if !force && elapsed < self.settings.progress_interval {
            return;
        }
        let delta = self.state.transferred.saturating_sub(self.last_emit_bytes);
        let secs = elapsed.as_secs_f64();
        self.state.speed = if secs > 0.0 { delta as f64 / secs } else { 0.0 };
        self.state.eta = match self.state.total {
            _ if self.state.status == TransferStatus::Completed => Eta::Remaining(Duration::ZERO),
            Some(total) if self.state.speed > 0.0 => {
                let remaining = total.saturating_sub(self.state.transferred) as f64;
                Eta::Remaining(Duration::from_secs_f64(remaining / self.state.speed))
            }
            _ => Eta::Calculating,
        };
        self.last_emit = now;
        self.last_emit_bytes = self.state.transferred;
        self.publish();
    }

    fn publish(&self) {
        let _ = self.progress.send(self.state.clone());
        self.snapshot.send_replace(self.state.clone());
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not remove partial file"),
    }
}
