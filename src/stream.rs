//! Rate-limited stream provider.
//!
//! Wraps host streams so every byte read or written is debited against two
//! shared token buckets, one per direction. Limits can be swapped at runtime;
//! a zero rate disables limiting for that direction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::HostError;
use crate::host::{HostStream, StreamOpener};
use crate::types::HostKey;

#[derive(Clone, Copy, Debug)]
struct Limits {
    download_bps: u64,
    upload_bps: u64,
    packet_size: u64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    fn new() -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: 0.0,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take `bytes` tokens at `rate` bytes/sec, sleeping until enough have
    /// accumulated. Burst capacity is one packet or one second of traffic,
    /// whichever is larger.
    async fn acquire(&self, bytes: u64, rate: u64, packet_size: u64) {
        if rate == 0 {
            return;
        }
        let burst = rate.max(packet_size) as f64;
        loop {
            let wait = {
                let mut st = self.state.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(st.last_refill).as_secs_f64();
                st.tokens = (st.tokens + elapsed * rate as f64).min(burst);
                st.last_refill = now;
                if st.tokens >= bytes as f64 {
                    st.tokens -= bytes as f64;
                    return;
                }
                let missing = bytes as f64 - st.tokens;
                Duration::from_secs_f64(missing / rate as f64)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Shared bandwidth accounting for all host streams.
pub struct BandwidthLimiter {
    limits: Mutex<Limits>,
    download: TokenBucket,
    upload: TokenBucket,
    downloaded_total: AtomicU64,
    uploaded_total: AtomicU64,
}

impl BandwidthLimiter {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            limits: Mutex::new(Limits {
                download_bps: 0,
                upload_bps: 0,
                packet_size: 1 << 14,
            }),
            download: TokenBucket::new(),
            upload: TokenBucket::new(),
            downloaded_total: AtomicU64::new(0),
            uploaded_total: AtomicU64::new(0),
        })
    }

    /// Atomically swap the limits. `(0, 0, _)` disables limiting.
    pub fn set_limits(&self, download_bps: u64, upload_bps: u64, packet_size: u64) {
        let mut limits = self.limits.lock();
        limits.download_bps = download_bps;
        limits.upload_bps = upload_bps;
        if packet_size > 0 {
            limits.packet_size = packet_size;
        }
    }

    /// Total bytes read from hosts since startup.
    #[must_use]
    pub fn downloaded_total(&self) -> u64 {
        self.downloaded_total.load(Ordering::Relaxed)
    }

    /// Total bytes written to hosts since startup.
    #[must_use]
    pub fn uploaded_total(&self) -> u64 {
        self.uploaded_total.load(Ordering::Relaxed)
    }

    async fn debit_download(&self, bytes: u64) {
        self.downloaded_total.fetch_add(bytes, Ordering::Relaxed);
        let limits = *self.limits.lock();
        self.download
            .acquire(bytes, limits.download_bps, limits.packet_size)
            .await;
    }

    async fn debit_upload(&self, bytes: u64) {
        self.uploaded_total.fetch_add(bytes, Ordering::Relaxed);
        let limits = *self.limits.lock();
        self.upload
            .acquire(bytes, limits.upload_bps, limits.packet_size)
            .await;
    }
}

/// A host stream with bandwidth accounting. Uploads acquire tokens before
/// the write; downloads debit after the frame arrives, since the size is
/// unknown up front.
pub struct RateLimitedStream {
    inner: Box<dyn HostStream>,
    limiter: Arc<BandwidthLimiter>,
    closed: bool,
}

impl RateLimitedStream {
    #[must_use]
    pub fn new(inner: Box<dyn HostStream>, limiter: Arc<BandwidthLimiter>) -> Self {
        Self {
            inner,
            limiter,
            closed: false,
        }
    }
}

#[async_trait]
impl HostStream for RateLimitedStream {
    async fn read_frame(&mut self) -> Result<Vec<u8>, HostError> {
        if self.closed {
            return Err(HostError::StreamClosed);
        }
        let frame = self.inner.read_frame().await?;
        self.limiter.debit_download(frame.len() as u64).await;
        Ok(frame)
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), HostError> {
        if self.closed {
            return Err(HostError::StreamClosed);
        }
        self.limiter.debit_upload(frame.len() as u64).await;
        self.inner.write_frame(frame).await
    }

    async fn close(&mut self) -> Result<(), HostError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.close().await
    }
}

/// Stream opener that wraps every opened stream in rate limiting.
pub struct RateLimitedStreamOpener {
    inner: Arc<dyn StreamOpener>,
    limiter: Arc<BandwidthLimiter>,
}

impl RateLimitedStreamOpener {
    #[must_use]
    pub fn new(inner: Arc<dyn StreamOpener>, limiter: Arc<BandwidthLimiter>) -> Self {
        Self { inner, limiter }
    }

    #[must_use]
    pub fn limiter(&self) -> &Arc<BandwidthLimiter> {
        &self.limiter
    }
}

#[async_trait]
impl StreamOpener for RateLimitedStreamOpener {
    async fn open_stream(&self, host: &HostKey) -> Result<Box<dyn HostStream>, HostError> {
        let inner = self.inner.open_stream(host).await?;
        Ok(Box::new(RateLimitedStream::new(inner, self.limiter.clone())))
    }
}
