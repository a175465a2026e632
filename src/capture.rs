//! HTML to bitmap capture through headless Chrome
//!
//! A capture loads the document into an isolated browser context, waits for
//! the network to go idle, then screenshots the `#content` element clipped to
//! the print width. The context is disposed whether the capture succeeded or
//! not.

use crate::browser_pool::{BrowserLease, BrowserPool};
use crate::error::CaptureError;
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{
    self, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
};
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, Viewport};
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams,
};
use chromiumoxide::cdp::js_protocol::runtime::EventConsoleApiCalled;
use chromiumoxide::listeners::EventStream;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info};

/// Element whose box is printed
pub const CONTENT_SELECTOR: &str = "#content";

/// On-page rectangle of the content element, in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Result of a successful capture
#[derive(Debug, Clone)]
pub struct CapturedBitmap {
    pub image: DynamicImage,
    /// Box of the content element before clipping
    pub bounding_box: BoundingBox,
    /// PNG written for this capture
    pub artifact: PathBuf,
}

/// Screenshot region for a content box inside a viewport
///
/// Anchored at the element origin, never wider or taller than the viewport.
pub fn clip_region(bbox: BoundingBox, viewport_width: u32, viewport_height: u32) -> BoundingBox {
    BoundingBox {
        x: bbox.x,
        y: bbox.y,
        width: bbox.width.min(viewport_width as f64),
        height: bbox.height.min(viewport_height as f64),
    }
}

/// Anything that turns an HTML document into a bitmap
#[async_trait]
pub trait Capturer: Send + Sync {
    /// Capture `html` at `target_width` pixels and write the PNG to `artifact`
    async fn capture(
        &self,
        html: &str,
        target_width: u32,
        artifact: &Path,
    ) -> Result<CapturedBitmap, CaptureError>;
}

/// Capturer backed by the shared [`BrowserPool`]
pub struct ChromeCapturer {
    pool: BrowserPool,
    viewport_height: u32,
    capture_timeout: Duration,
    idle_window: Duration,
}

impl ChromeCapturer {
    pub fn new(
        pool: BrowserPool,
        viewport_height: u32,
        capture_timeout: Duration,
        idle_window: Duration,
    ) -> Self {
        Self {
            pool,
            viewport_height,
            capture_timeout,
            idle_window,
        }
    }

    async fn open_isolated_page(
        lease: &BrowserLease,
    ) -> Result<(Page, BrowserContextId), CaptureError> {
        let mut browser = lease.browser.lock().await;

        let context_id = browser
            .create_browser_context(CreateBrowserContextParams::default())
            .await
            .map_err(|e| CaptureError::BrowserLaunch(format!("browser context: {}", e)))?;

        let target = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .build()
            .map_err(CaptureError::Navigation)?;

        match browser.new_page(target).await {
            Ok(page) => Ok((page, context_id)),
            Err(e) => {
                let _ = browser.dispose_browser_context(context_id).await;
                Err(CaptureError::Navigation(e.to_string()))
            }
        }
    }

    async fn capture_on_page(
        &self,
        page: &Page,
        html: &str,
        target_width: u32,
        artifact: &Path,
    ) -> Result<CapturedBitmap, CaptureError> {
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(target_width as i64)
            .height(self.viewport_height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(CaptureError::Navigation)?;
        page.execute(metrics)
            .await
            .map_err(|e| CaptureError::Navigation(e.to_string()))?;

        forward_console(page).await;

        page.execute(network::EnableParams::default())
            .await
            .map_err(|e| CaptureError::Navigation(e.to_string()))?;
        let watcher = NetworkWatcher::attach(page).await?;

        page.set_content(html)
            .await
            .map_err(|e| CaptureError::Navigation(e.to_string()))?;
        watcher.wait_idle(self.idle_window).await;

        let element = page
            .find_element(CONTENT_SELECTOR)
            .await
            .map_err(|_| CaptureError::ContentMissing)?;
        let bbox = element
            .bounding_box()
            .await
            .map_err(|e| CaptureError::Screenshot(format!("bounding box: {}", e)))?;
        let bounding_box = BoundingBox {
            x: bbox.x,
            y: bbox.y,
            width: bbox.width,
            height: bbox.height,
        };

        let clip = clip_region(bounding_box, target_width, self.viewport_height);
        if clip.width < 1.0 || clip.height < 1.0 {
            return Err(CaptureError::Screenshot(format!(
                "content element has no area ({}x{})",
                clip.width, clip.height
            )));
        }

        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .clip(Viewport {
                x: clip.x,
                y: clip.y,
                width: clip.width,
                height: clip.height,
                scale: 1.0,
            })
            .build();
        let png = page
            .screenshot(params)
            .await
            .map_err(|e| CaptureError::Screenshot(e.to_string()))?;

        tokio::fs::write(artifact, &png).await?;

        let mut image = image::load_from_memory(&png)?;
        if image.width() > target_width {
            image = image.crop_imm(0, 0, target_width, image.height());
        }

        Ok(CapturedBitmap {
            image,
            bounding_box,
            artifact: artifact.to_path_buf(),
        })
    }
}

#[async_trait]
impl Capturer for ChromeCapturer {
    async fn capture(
        &self,
        html: &str,
        target_width: u32,
        artifact: &Path,
    ) -> Result<CapturedBitmap, CaptureError> {
        let start = Instant::now();
        let mut lease = self.pool.acquire().await?;

        let (page, context_id) = match Self::open_isolated_page(&lease).await {
            Ok(opened) => opened,
            Err(e) => {
                lease.mark_failed();
                return Err(e);
            }
        };

        let result = match timeout(
            self.capture_timeout,
            self.capture_on_page(&page, html, target_width, artifact),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CaptureError::Timeout(self.capture_timeout)),
        };

        let _ = page.close().await;
        let dispose_result = lease
            .browser
            .lock()
            .await
            .dispose_browser_context(context_id)
            .await;
        if let Err(e) = dispose_result {
            debug!("Disposing browser context failed: {}", e);
            lease.mark_failed();
        }

        match &result {
            Ok(bitmap) => info!(
                "Captured {}x{} from browser {} in {:?}",
                bitmap.image.width(),
                bitmap.image.height(),
                lease.instance_id,
                start.elapsed()
            ),
            Err(CaptureError::Timeout(_)) => lease.mark_failed(),
            Err(_) => {}
        }

        result
    }
}

/// Tracks in-flight requests of one page
struct NetworkWatcher {
    requests: EventStream<EventRequestWillBeSent>,
    finished: EventStream<EventLoadingFinished>,
    failed: EventStream<EventLoadingFailed>,
}

impl NetworkWatcher {
    async fn attach(page: &Page) -> Result<Self, CaptureError> {
        let listen_err = |e: chromiumoxide::error::CdpError| CaptureError::Navigation(e.to_string());
        Ok(Self {
            requests: page.event_listener::<EventRequestWillBeSent>().await.map_err(listen_err)?,
            finished: page.event_listener::<EventLoadingFinished>().await.map_err(listen_err)?,
            failed: page.event_listener::<EventLoadingFailed>().await.map_err(listen_err)?,
        })
    }

    /// Resolve once no request has been in flight for `window`
    async fn wait_idle(mut self, window: Duration) {
        let mut in_flight: HashSet<String> = HashSet::new();
        loop {
            let quiet = tokio::time::sleep(window);
            tokio::select! {
                Some(event) = self.requests.next() => {
                    in_flight.insert(event.request_id.inner().clone());
                }
                Some(event) = self.finished.next() => {
                    in_flight.remove(event.request_id.inner());
                }
                Some(event) = self.failed.next() => {
                    in_flight.remove(event.request_id.inner());
                }
                _ = quiet, if in_flight.is_empty() => return,
                else => return,
            }
        }
    }
}

async fn forward_console(page: &Page) {
    let mut events = match page.event_listener::<EventConsoleApiCalled>().await {
        Ok(events) => events,
        Err(e) => {
            debug!("Console forwarding unavailable: {}", e);
            return;
        }
    };

    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let text = event
                .args
                .iter()
                .filter_map(|arg| arg.value.as_ref())
                .map(|value| match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(" ");
            debug!("page console: {}", text);
        }
    });
}
