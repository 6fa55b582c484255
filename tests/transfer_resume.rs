use appdown::{
    AppdownError, ByteSource, Eta, SourceBody, TransferEngine, TransferSettings, TransferState,
    TransferStatus,
};
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const SIZE: usize = 100 * 1024 * 1024;
const CHUNK: usize = 256 * 1024;
const PAUSE_AT: u64 = 40 * 1024 * 1024;

/// Lazily streams a deterministic buffer, sleeping between chunks.
struct ThrottledSource {
    data: Bytes,
    delay: Duration,
    honours_range: bool,
    opens: Arc<Mutex<Vec<u64>>>,
}

impl ThrottledSource {
    fn new(data: Bytes, honours_range: bool) -> Self {
        Self {
            data,
            delay: Duration::from_millis(1),
            honours_range,
            opens: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl ByteSource for ThrottledSource {
    async fn open(&self, _url: &str, offset: u64) -> Result<SourceBody, AppdownError> {
        self.opens.lock().push(offset);
        let start = if self.honours_range { offset as usize } else { 0 };
        let data = self.data.clone();
        let delay = self.delay;
        let body = stream::unfold(start, move |pos| {
            let data = data.clone();
            async move {
                if pos >= data.len() {
                    return None;
                }
                tokio::time::sleep(delay).await;
                let end = (pos + CHUNK).min(data.len());
                Some((Ok::<_, AppdownError>(data.slice(pos..end)), end))
            }
        });
        Ok(SourceBody {
            resumed: self.honours_range && offset > 0,
            length: Some((self.data.len() - start) as u64),
            stream: body.boxed(),
        })
    }
}

fn payload() -> Bytes {
    let mut data = vec![0u8; SIZE];
    let mut x: u32 = 0x9e37_79b9;
    for byte in data.iter_mut() {
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        *byte = x as u8;
    }
    Bytes::from(data)
}

fn settings() -> TransferSettings {
    TransferSettings {
        progress_interval: Duration::from_millis(10),
        retry_base_delay: Duration::from_millis(5),
        ..TransferSettings::default()
    }
}

async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<TransferState>,
    mut done: impl FnMut(&TransferState) -> bool,
) -> TransferState {
    loop {
        let state = rx.recv().await.unwrap();
        if done(&state) {
            return state;
        }
    }
}

async fn pause_and_resume(honours_range: bool) {
    let data = payload();
    let expected = hex::encode(Sha256::digest(&data));
    let source = ThrottledSource::new(data, honours_range);
    let opens = source.opens.clone();
    let engine = TransferEngine::new(source, settings());

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("big.ipa");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = engine.start_url("mem://big", &dest, tx);

    wait_for(&mut rx, |s| s.transferred >= PAUSE_AT).await;
    assert!(handle.pause());
    let paused = wait_for(&mut rx, |s| s.status == TransferStatus::Paused).await;
    assert!(paused.transferred >= PAUSE_AT);
    assert!(paused.transferred < SIZE as u64);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.state().status, TransferStatus::Paused);
    assert_eq!(handle.state().transferred, paused.transferred);
    assert_eq!(std::fs::metadata(&dest).unwrap().len(), paused.transferred);

    assert!(handle.resume());
    let report = handle.wait().await.unwrap();
    assert_eq!(report.bytes, SIZE as u64);

    let written = std::fs::read(&dest).unwrap();
    assert_eq!(hex::encode(Sha256::digest(&written)), expected);

    let opens = opens.lock().clone();
    assert_eq!(opens.len(), 2);
    assert_eq!(opens[0], 0);
    assert_eq!(opens[1], paused.transferred);

    let mut last = None;
    while let Ok(state) = rx.try_recv() {
        last = Some(state);
    }
    let last = last.unwrap();
    assert_eq!(last.status, TransferStatus::Completed);
    assert_eq!(last.transferred, SIZE as u64);
    assert_eq!(last.total, Some(SIZE as u64));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn paused_transfer_resumes_to_identical_file() {
    pause_and_resume(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn source_ignoring_ranges_restarts_cleanly() {
    pause_and_resume(false).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_while_paused_removes_partial_file() {
    let source = ThrottledSource::new(payload(), true);
    let engine = TransferEngine::new(source, settings());
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("big.ipa");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = engine.start_url("mem://big", &dest, tx);

    wait_for(&mut rx, |s| s.transferred >= 4 * CHUNK as u64).await;
    handle.pause();
    wait_for(&mut rx, |s| s.status == TransferStatus::Paused).await;
    assert!(dest.exists());

    assert!(handle.cancel());
    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, AppdownError::Cancelled));
    assert!(!dest.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_pauses_keep_cadence_and_content() {
    let data = payload();
    let expected = hex::encode(Sha256::digest(&data));
    let mut source = ThrottledSource::new(data, true);
    source.delay = Duration::from_millis(2);
    let opens = source.opens.clone();
    let interval = Duration::from_millis(100);
    let engine = TransferEngine::new(
        source,
        TransferSettings {
            progress_interval: interval,
            ..settings()
        },
    );

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("big.ipa");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let started = Instant::now();
    let handle = engine.start_url("mem://big", &dest, tx);

    let thresholds = [20u64, 40, 60].map(|mib| mib * 1024 * 1024);
    let mut next = 0;
    let mut pausing = false;
    let mut log: Vec<(Instant, TransferState)> = Vec::new();
    while let Some(state) = rx.recv().await {
        log.push((Instant::now(), state.clone()));
        match state.status {
            TransferStatus::Downloading
                if !pausing && next < thresholds.len() && state.transferred >= thresholds[next] =>
            {
                assert!(handle.pause());
                pausing = true;
                next += 1;
            }
            TransferStatus::Paused => {
                pausing = false;
                tokio::time::sleep(Duration::from_millis(20)).await;
                assert!(handle.resume());
            }
            _ => {}
        }
    }
    let elapsed = started.elapsed();

    let report = handle.wait().await.unwrap();
    assert_eq!(report.bytes, SIZE as u64);
    let written = std::fs::read(&dest).unwrap();
    assert_eq!(hex::encode(Sha256::digest(&written)), expected);
    assert_eq!(opens.lock().len(), 4);

    let paused = log
        .iter()
        .filter(|(_, s)| s.status == TransferStatus::Paused)
        .count();
    assert_eq!(paused, 3);

    for pair in log.windows(2) {
        let (at, prev) = &pair[0];
        let (next_at, state) = &pair[1];
        if prev.status == TransferStatus::Paused {
            assert_eq!(state.status, TransferStatus::Downloading);
            assert_eq!(state.speed, 0.0);
            assert_eq!(state.eta, Eta::Calculating);
        }
        if prev.status == TransferStatus::Downloading && state.status == TransferStatus::Downloading {
            let gap = next_at.duration_since(*at);
            assert!(gap + Duration::from_millis(30) >= interval, "updates {:?} apart", gap);
        }
    }

    let downloading = log
        .iter()
        .filter(|(_, s)| s.status == TransferStatus::Downloading)
        .count() as u128;
    assert!(downloading <= elapsed.as_millis() / interval.as_millis() + 8);
    assert!(downloading < (SIZE / CHUNK) as u128 / 4);

    let (_, last) = log.last().unwrap();
    assert_eq!(last.status, TransferStatus::Completed);
    assert_eq!(last.transferred, SIZE as u64);
    assert_eq!(last.eta, Eta::Remaining(Duration::ZERO));
}
