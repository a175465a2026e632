use std::time::Duration;
use thiserror::Error;

/// Failures while turning HTML into a bitmap
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("Browser launch failed: {0}")]
    BrowserLaunch(String),

    #[error("Browser instance unavailable")]
    BrowserUnavailable,

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Capture timed out after {0:?}")]
    Timeout(Duration),

    #[error("content element missing")]
    ContentMissing,

    #[error("Screenshot failed: {0}")]
    Screenshot(String),

    #[error("Captured image could not be decoded: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// Failures while converting a bitmap into printer commands
#[derive(Debug, Clone, Error)]
pub enum EncodeError {
    #[error("Image is empty ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },

    #[error("Image too large for the raster command: {width}x{height}")]
    TooLarge { width: u32, height: u32 },

    #[error("Image could not be decoded: {0}")]
    Decode(String),
}

/// Failures while handing a device buffer to the OS print queue
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("Writing {path} failed: {reason}")]
    Write { path: String, reason: String },

    #[error("Spawning print client failed: {0}")]
    Spawn(String),

    #[error("Print client exited with {0}")]
    ClientFailed(String),
}

/// Any failure of the background print pipeline
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Print queue is full ({0} pending jobs)")]
    QueueFull(usize),
}

impl PipelineError {
    /// Name of the pipeline stage the error came from
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Capture(_) => "capture",
            PipelineError::Encode(_) => "encode",
            PipelineError::Dispatch(_) => "dispatch",
            PipelineError::QueueFull(_) => "queue",
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PipelineError::Capture(CaptureError::ContentMissing) => ErrorSeverity::Low,
            PipelineError::Capture(CaptureError::BrowserLaunch(_)) => ErrorSeverity::High,
            PipelineError::Capture(CaptureError::BrowserUnavailable) => ErrorSeverity::High,
            PipelineError::Encode(_) => ErrorSeverity::Low,
            PipelineError::Dispatch(DispatchError::Spawn(_)) => ErrorSeverity::High,
            PipelineError::QueueFull(_) => ErrorSeverity::High,
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Io(err.to_string())
    }
}

impl From<image::ImageError> for CaptureError {
    fn from(err: image::ImageError) -> Self {
        CaptureError::Decode(err.to_string())
    }
}

impl From<image::ImageError> for EncodeError {
    fn from(err: image::ImageError) -> Self {
        EncodeError::Decode(err.to_string())
    }
}
