use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};
use wa_sender_core::automation::NumberProbe;
use wa_sender_core::diagnostics;
use wa_sender_core::models::{NumberProbeResult, ScreenshotVerification};
use wa_sender_core::CoreError;

use crate::probe_ipc::{parse_output, ProbeCommand};

/// Runs the verifier script once per call. A run that outlives `timeout` is
/// killed when its handle drops.
pub struct PythonProbe {
    python: String,
    script: PathBuf,
    timeout: Duration,
    log_dir: Option<PathBuf>,
}

impl PythonProbe {
    pub fn new(python: impl Into<String>, script: impl Into<PathBuf>, timeout: Duration, log_dir: Option<PathBuf>) -> Self {
        Self {
            python: python.into(),
            script: script.into(),
            timeout,
            log_dir,
        }
    }

    pub async fn run<T: DeserializeOwned>(&self, command: ProbeCommand) -> Result<T, CoreError> {
        let start = Instant::now();
        let result = self.run_inner(&command).await;
        let err = result.as_ref().err().map(|e| e.to_string());
        self.log_timing(command.name(), start.elapsed(), err.as_deref());
        result
    }

    async fn run_inner<T: DeserializeOwned>(&self, command: &ProbeCommand) -> Result<T, CoreError> {
        if !self.script.exists() {
            return Err(CoreError::Probe(format!("verifier script missing: {}", self.script.display())));
        }
        let child = Command::new(&self.python)
            .arg(&self.script)
            .args(command.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::Probe(format!("spawn {}: {}", self.python, e)))?;

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CoreError::Timeout(format!("verifier exceeded {} s", self.timeout.as_secs())))?
            .map_err(|e| CoreError::Probe(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            warn!(code, "verifier failed: {}", &stderr[..stderr.len().min(500)]);
            return Err(CoreError::Probe(format!("verifier exited with {}: {}", code, stderr.trim())));
        }
        debug!("verifier stdout ({} bytes)", stdout.len());
        parse_output(&stdout)
    }

    fn log_timing(&self, cmd: &str, elapsed: Duration, err: Option<&str>) {
        let Some(log_dir) = self.log_dir.as_ref() else { return };
        let mut msg = format!("cmd={} ok={} ms={}", cmd, err.is_none() as u8, elapsed.as_millis());
        if let Some(err) = err {
            msg.push_str(" err=");
            msg.push_str(err);
        }
        if let Err(err) = diagnostics::log_event(log_dir, "probe_timing", &msg) {
            warn!("diagnostics log write failed: {}", err);
        }
    }

    pub async fn screenshot_timestamp(&self) -> Result<ScreenshotVerification, CoreError> {
        self.run(ProbeCommand::ScreenshotTimestamp).await
    }
}

#[async_trait]
impl NumberProbe for PythonProbe {
    async fn verify_number_presence(&self, number: &str) -> Result<NumberProbeResult, CoreError> {
        self.run(ProbeCommand::Number(number.to_string())).await
    }
}
