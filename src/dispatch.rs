//! Hand-off of device buffers to the OS print queue
//!
//! The buffer is written next to the capture artifact as `<artifact>.bin`
//! and submitted with `lp -d <queue> -o raw <artifact>.bin`. The client runs
//! detached: its exit status is logged, never returned.

use crate::error::DispatchError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

static DEVICE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)device for (.+?):").expect("valid regex"));

/// Destination for encoded print jobs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PrintSink: Send + Sync {
    /// Persist `buffer` for `artifact` and submit it to `queue`
    async fn dispatch(
        &self,
        buffer: &[u8],
        artifact: &Path,
        queue: &str,
    ) -> Result<(), DispatchError>;
}

/// Path of the device buffer belonging to a capture artifact
pub fn bin_path(artifact: &Path) -> PathBuf {
    let mut path = OsString::from(artifact.as_os_str());
    path.push(".bin");
    PathBuf::from(path)
}

/// Argument list for the raw print client, in the order queues expect
///
/// ```rust
/// use print_endpoint::lp_args;
/// use std::path::Path;
///
/// assert_eq!(
///     lp_args("front-counter", Path::new("/tmp/42")),
///     vec!["-d", "front-counter", "-o", "raw", "/tmp/42.bin"]
/// );
/// ```
pub fn lp_args(queue: &str, artifact: &Path) -> Vec<String> {
    vec![
        "-d".to_string(),
        queue.to_string(),
        "-o".to_string(),
        "raw".to_string(),
        bin_path(artifact).to_string_lossy().into_owned(),
    ]
}

/// Dispatcher backed by the CUPS `lp` client
#[derive(Debug, Clone)]
pub struct LpDispatcher {
    program: String,
}

impl LpDispatcher {
    pub fn new() -> Self {
        Self::with_program("lp")
    }

    /// Use a different executable with the same argument shape
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for LpDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PrintSink for LpDispatcher {
    async fn dispatch(
        &self,
        buffer: &[u8],
        artifact: &Path,
        queue: &str,
    ) -> Result<(), DispatchError> {
        let path = bin_path(artifact);
        tokio::fs::write(&path, buffer)
            .await
            .map_err(|e| DispatchError::Write {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        debug!("Wrote {} bytes to {}", buffer.len(), path.display());

        let args = lp_args(queue, artifact);
        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DispatchError::Spawn(format!("{}: {}", self.program, e)))?;

        info!("Submitted {} to queue {}", path.display(), queue);

        let program = self.program.clone();
        tokio::spawn(async move {
            match wait_for_client(child).await {
                Ok(()) => debug!("{} {:?} finished", program, args),
                Err(err) => warn!("{} {:?}: {}", program, args, err),
            }
        });

        Ok(())
    }
}

/// Wait for a spawned client while draining its stderr
async fn wait_for_client(child: Child) -> Result<(), DispatchError> {
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| DispatchError::ClientFailed(format!("wait failed: {}", e)))?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(DispatchError::ClientFailed(format!(
        "{} {}",
        output.status,
        stderr.trim()
    )))
}

/// Names of the printer queues known to CUPS
pub async fn list_destinations() -> Result<Vec<String>, DispatchError> {
    let output = Command::new("lpstat")
        .arg("-s")
        .output()
        .await
        .map_err(|e| DispatchError::Spawn(format!("lpstat: {}", e)))?;

    if !output.status.success() {
        return Err(DispatchError::ClientFailed(format!(
            "lpstat exited with {}",
            output.status
        )));
    }

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(parse_destinations(&text))
}

/// Extract queue names from `lpstat -s` output
pub fn parse_destinations(output: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for captures in DEVICE_LINE.captures_iter(output) {
        let name = captures[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lp_args_exact_shape() {
        assert_eq!(
            lp_args("front-counter", Path::new("/tmp/42")),
            vec!["-d", "front-counter", "-o", "raw", "/tmp/42.bin"]
        );
    }

    #[test]
    fn test_bin_path_appends_suffix() {
        assert_eq!(
            bin_path(Path::new("./temp/123.png")),
            PathBuf::from("./temp/123.png.bin")
        );
    }

    #[test]
    fn test_parse_destinations() {
        let output = "system default destination: front-counter\n\
                      device for front-counter: usb://EPSON/TM-T20\n\
                      device for kitchen: socket://10.0.0.9:9100\n\
                      device for kitchen: socket://10.0.0.9:9100\n";
        assert_eq!(parse_destinations(output), vec!["front-counter", "kitchen"]);
        assert!(parse_destinations("no destinations added.").is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_writes_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("7.png");
        // `true` accepts any arguments and exits successfully
        let dispatcher = LpDispatcher::with_program("true");

        dispatcher
            .dispatch(&[0x1D, 0x76, 0x30], &artifact, "front-counter")
            .await
            .unwrap();

        let written = std::fs::read(dir.path().join("7.png.bin")).unwrap();
        assert_eq!(written, vec![0x1D, 0x76, 0x30]);
    }

    #[tokio::test]
    async fn test_missing_client_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = LpDispatcher::with_program("/nonexistent/lp-client");
        let err = dispatcher
            .dispatch(&[1, 2, 3], &dir.path().join("1.png"), "q")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Spawn(_)));
        // the buffer is still written before the client is started
        assert!(dir.path().join("1.png.bin").exists());
    }

    #[tokio::test]
    async fn test_noisy_failing_client_does_not_block() {
        // more stderr than a pipe buffer holds
        let child = Command::new("sh")
            .args(["-c", "head -c 200000 /dev/zero >&2; exit 3"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(10), wait_for_client(child))
            .await
            .expect("client should not stall on a full stderr pipe");
        assert!(matches!(result, Err(DispatchError::ClientFailed(_))));
    }

    #[tokio::test]
    async fn test_client_stderr_is_reported() {
        let child = Command::new("sh")
            .args(["-c", "echo 'lp: The printer or class does not exist.' >&2; exit 1"])
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();

        match wait_for_client(child).await {
            Err(DispatchError::ClientFailed(detail)) => {
                assert!(detail.contains("does not exist"), "{}", detail)
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unwritable_path_is_a_write_error() {
        let dispatcher = LpDispatcher::with_program("true");
        let err = dispatcher
            .dispatch(&[1], Path::new("/nonexistent-dir/x/1.png"), "q")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Write { .. }));
    }
}
