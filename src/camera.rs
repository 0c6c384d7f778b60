// ─────────────────────────────────────────────────────────────────
//  camera.rs — Continuously refreshed frame source
//
//  One capture device stays open; a background task keeps the
//  latest frame in a single slot. Snapshots copy that slot and
//  encode it to JPEG without waiting on the device.
// ─────────────────────────────────────────────────────────────────

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::CameraConfig;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Something that yields frames, one read at a time.
pub trait CaptureDevice: Send {
    fn read_frame(&mut self) -> BoxFuture<'_, anyhow::Result<DynamicImage>>;
}

/// Latest frame plus whether the source is still delivering.
#[derive(Default)]
struct FrameBuffer {
    frame: Option<Arc<DynamicImage>>,
    captured_at: Option<Instant>,
    connected: bool,
}

/// Owns the capture device and its refresh loop.
pub struct FrameSource {
    cfg: CameraConfig,
    buffer: Arc<RwLock<FrameBuffer>>,
    worker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl FrameSource {
    pub fn new(cfg: CameraConfig) -> Self {
        Self {
            cfg,
            buffer: Arc::new(RwLock::new(FrameBuffer::default())),
            worker: Mutex::new(None),
        }
    }

    /// Open the configured URI and start refreshing.
    pub async fn connect(&self) -> bool {
        let device = match open_device(&self.cfg.url) {
            Ok(d) => d,
            Err(e) => {
                error!("Could not open camera {}: {e}", self.cfg.url);
                return false;
            }
        };
        self.connect_with(device).await
    }

    /// Take over an already opened device: one test read, then the loop.
    pub async fn connect_with(&self, mut device: Box<dyn CaptureDevice>) -> bool {
        // Never run two refresh loops against the same slot
        self.close().await;

        let first = match device.read_frame().await {
            Ok(f) => f,
            Err(e) => {
                warn!("Camera test read failed: {e}");
                return false;
            }
        };

        self.store(first);
        info!("📷 Camera connected ({}x{})", self.width_height().0, self.width_height().1);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(refresh_loop(
            device,
            self.buffer.clone(),
            self.cfg.clone(),
            cancel.clone(),
        ));

        *self.worker.lock().unwrap_or_else(|p| p.into_inner()) = Some((cancel, handle));
        true
    }

    fn store(&self, frame: DynamicImage) {
        let mut buf = self.buffer.write().unwrap_or_else(|p| p.into_inner());
        buf.frame = Some(Arc::new(frame));
        buf.captured_at = Some(Instant::now());
        buf.connected = true;
    }

    fn width_height(&self) -> (u32, u32) {
        let buf = self.buffer.read().unwrap_or_else(|p| p.into_inner());
        buf.frame.as_ref().map_or((0, 0), |f| (f.width(), f.height()))
    }

    /// JPEG of the most recent frame, or `None` without a live frame.
    pub fn snapshot(&self, quality: u8) -> Option<Vec<u8>> {
        let frame = {
            let buf = self.buffer.read().unwrap_or_else(|p| p.into_inner());
            if !buf.connected {
                return None;
            }
            buf.frame.clone()?
        };

        match compress_to_jpeg(&frame, quality, self.cfg.max_dimension) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("JPEG encoding failed: {e}");
                None
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.buffer.read().unwrap_or_else(|p| p.into_inner()).connected
    }

    /// Age of the frame a snapshot would serve.
    pub fn frame_age(&self) -> Option<Duration> {
        let buf = self.buffer.read().unwrap_or_else(|p| p.into_inner());
        buf.captured_at.map(|t| t.elapsed())
    }

    /// Stop the refresh loop and release the device.
    pub async fn close(&self) {
        let worker = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some((cancel, handle)) = worker {
            cancel.cancel();
            match tokio::time::timeout(CLOSE_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!("Camera refresh loop joined"),
                Ok(Err(e)) => error!("Camera refresh loop panicked: {e}"),
                Err(_) => warn!("Camera refresh loop did not stop within {CLOSE_TIMEOUT:?}"),
            }
        }

        let mut buf = self.buffer.write().unwrap_or_else(|p| p.into_inner());
        buf.connected = false;
        buf.frame = None;
        buf.captured_at = None;
    }
}

async fn refresh_loop(
    mut device: Box<dyn CaptureDevice>,
    buffer: Arc<RwLock<FrameBuffer>>,
    cfg: CameraConfig,
    cancel: CancellationToken,
) {
    let interval = Duration::from_millis(cfg.refresh_interval_ms);
    let backoff = Duration::from_millis(cfg.failure_backoff_ms);
    let mut failures = 0u32;

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            r = device.read_frame() => r,
        };

        let pause = match read {
            Ok(frame) => {
                failures = 0;
                let mut buf = buffer.write().unwrap_or_else(|p| p.into_inner());
                buf.frame = Some(Arc::new(frame));
                buf.captured_at = Some(Instant::now());
                buf.connected = true;
                interval
            }
            Err(e) => {
                failures += 1;
                debug!("Frame read failed ({failures}/{}): {e}", cfg.max_consecutive_failures);
                if failures >= cfg.max_consecutive_failures {
                    error!("Camera gave {failures} consecutive failed reads; marking disconnected");
                    buffer.write().unwrap_or_else(|p| p.into_inner()).connected = false;
                    break;
                }
                backoff
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(pause) => {}
        }
    }
    debug!("Camera refresh loop exiting");
}

/// Compress a DynamicImage to JPEG bytes in memory, optionally resizing.
pub fn compress_to_jpeg(img: &DynamicImage, quality: u8, max_dim: u32) -> anyhow::Result<Vec<u8>> {
    let img = if max_dim > 0 && (img.width() > max_dim || img.height() > max_dim) {
        let ratio = max_dim as f32 / img.width().max(img.height()) as f32;
        let new_w = ((img.width() as f32 * ratio) as u32).max(1);
        let new_h = ((img.height() as f32 * ratio) as u32).max(1);
        img.resize(new_w, new_h, image::imageops::FilterType::Triangle)
    } else {
        img.clone()
    };

    // The encoder wants 1..=100
    let quality = quality.clamp(1, 100);

    let rgb = img.to_rgb8();
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    rgb.write_with_encoder(encoder)?;
    Ok(buf.into_inner())
}

// ── Devices ─────────────────────────────────────────────────────

/// Pick a device for a capture URI.
pub fn open_device(uri: &str) -> anyhow::Result<Box<dyn CaptureDevice>> {
    match Url::parse(uri) {
        Ok(url) => match url.scheme() {
            "http" | "https" => Ok(Box::new(HttpStillDevice::new(url)?)),
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| anyhow::anyhow!("bad file URI {uri}"))?;
                Ok(Box::new(FileDevice { path }))
            }
            other => anyhow::bail!("unsupported capture scheme {other:?}"),
        },
        // No scheme: treat as a local path
        Err(url::ParseError::RelativeUrlWithoutBase) => Ok(Box::new(FileDevice {
            path: PathBuf::from(uri),
        })),
        Err(e) => Err(anyhow::anyhow!("bad capture URI {uri}: {e}")),
    }
}

/// Camera exposing a still JPEG over HTTP, polled per frame.
pub struct HttpStillDevice {
    client: reqwest::Client,
    url: Url,
}

impl HttpStillDevice {
    pub fn new(url: Url) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client, url })
    }
}

impl CaptureDevice for HttpStillDevice {
    fn read_frame(&mut self) -> BoxFuture<'_, anyhow::Result<DynamicImage>> {
        Box::pin(async move {
            let bytes = self
                .client
                .get(self.url.clone())
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?;
            let img = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes)).await??;
            Ok(img)
        })
    }
}

/// Image file that something else keeps overwriting.
pub struct FileDevice {
    path: PathBuf,
}

impl CaptureDevice for FileDevice {
    fn read_frame(&mut self) -> BoxFuture<'_, anyhow::Result<DynamicImage>> {
        Box::pin(async move {
            let bytes = tokio::fs::read(&self.path).await?;
            let img = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes)).await??;
            Ok(img)
        })
    }
}
