use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};
use wa_sender_core::automation::MessagingAutomation;
use wa_sender_core::diagnostics;
use wa_sender_core::models::{KillResult, OpenRequest, OpenResult, ScreenshotVerification};
use wa_sender_core::phone;
use wa_sender_core::CoreError;

use crate::config::AppConfig;
use crate::probe_process::PythonProbe;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Drives the installed desktop client through external commands.
pub struct DesktopAutomation {
    opener: Vec<String>,
    clipboard: Vec<String>,
    paste: Vec<String>,
    send: Vec<String>,
    kill: Vec<String>,
    keystroke_delay: Duration,
    probe: Arc<PythonProbe>,
    log_dir: PathBuf,
}

impl DesktopAutomation {
    pub fn new(config: &AppConfig, probe: Arc<PythonProbe>) -> Self {
        Self {
            opener: config.opener.clone(),
            clipboard: config.clipboard_command.clone(),
            paste: config.paste_command.clone(),
            send: config.send_command.clone(),
            kill: config.kill_command(),
            keystroke_delay: Duration::from_millis(config.keystroke_delay_ms),
            probe,
            log_dir: config.log_dir(),
        }
    }

    /// Types the clipboard into the open chat and presses send. Runs
    /// detached from the open call; failures only reach the log.
    fn spawn_keystrokes(&self) {
        let paste = self.paste.clone();
        let send = self.send.clone();
        let delay = self.keystroke_delay;
        let log_dir = self.log_dir.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            if let Err(err) = run_command(&paste, None).await {
                warn!("paste failed: {}", err);
                if let Err(log_err) = diagnostics::log_event(&log_dir, "paste_failed", &err.to_string()) {
                    warn!("diagnostics log write failed: {}", log_err);
                }
                return;
            }
            sleep(delay).await;
            if let Err(err) = run_command(&send, None).await {
                warn!("send keystroke failed: {}", err);
                if let Err(log_err) = diagnostics::log_event(&log_dir, "send_keystroke_failed", &err.to_string()) {
                    warn!("diagnostics log write failed: {}", log_err);
                }
            }
        });
    }
}

fn split(argv: &[String]) -> Result<(&String, &[String]), CoreError> {
    argv.split_first()
        .ok_or_else(|| CoreError::InvalidArgument("empty command in config".to_string()))
}

/// Runs `argv` to completion, feeding `stdin` when given.
async fn run_command(argv: &[String], stdin: Option<&str>) -> Result<std::process::Output, CoreError> {
    let (program, args) = split(argv)?;
    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CoreError::Probe(format!("spawn {}: {}", program, e)))?;

    if let Some(input) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| CoreError::Probe(format!("write to {}: {}", program, e)))?;
        }
    }

    timeout(COMMAND_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| CoreError::Timeout(format!("{} exceeded {} s", program, COMMAND_TIMEOUT.as_secs())))?
        .map_err(|e| CoreError::Probe(e.to_string()))
}

fn failure(output: &std::process::Output) -> Option<String> {
    if output.status.success() {
        return None;
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Some(format!(
        "exit {}: {}",
        output.status.code().unwrap_or(-1),
        stderr.trim()
    ))
}

#[async_trait]
impl MessagingAutomation for DesktopAutomation {
    async fn open_messaging_app(&self, request: &OpenRequest) -> Result<OpenResult, CoreError> {
        let url = phone::to_protocol_url(&request.url).unwrap_or_else(|| request.url.clone());

        let copied = run_command(&self.clipboard, Some(&request.text)).await?;
        if let Some(error) = failure(&copied) {
            return Ok(OpenResult { success: false, error: Some(format!("clipboard: {}", error)) });
        }

        let mut argv = self.opener.clone();
        argv.push(url);
        let opened = run_command(&argv, None).await?;
        if let Some(error) = failure(&opened) {
            return Ok(OpenResult { success: false, error: Some(error) });
        }
        info!("messaging client opened");

        if request.simulate_paste {
            self.spawn_keystrokes();
        }
        Ok(OpenResult { success: true, error: None })
    }

    async fn verify_screenshot_timestamp(&self) -> Result<ScreenshotVerification, CoreError> {
        self.probe.screenshot_timestamp().await
    }

    async fn kill_messaging_app(&self) -> Result<KillResult, CoreError> {
        let output = run_command(&self.kill, None).await?;
        Ok(match failure(&output) {
            None => KillResult { success: true, message: Some("messaging client closed".to_string()) },
            Some(error) => KillResult { success: false, message: Some(error) },
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn automation(dir: &std::path::Path, opener: &[&str]) -> DesktopAutomation {
        let config = AppConfig {
            data_dir: dir.to_path_buf(),
            opener: strings(opener),
            clipboard_command: strings(&["sh", "-c", &format!("cat > {}/clip.txt", dir.display())]),
            paste_command: strings(&["true"]),
            send_command: strings(&["true"]),
            app_process_name: "wa-sender-test-no-such-process".to_string(),
            ..AppConfig::default()
        };
        let probe = Arc::new(PythonProbe::new("python3", dir.join("verify.py"), COMMAND_TIMEOUT, None));
        DesktopAutomation::new(&config, probe)
    }

    #[tokio::test]
    async fn open_copies_text_then_runs_opener_with_protocol_url() {
        let dir = tempdir().expect("temp");
        let opened = dir.path().join("opened.txt");
        let script = format!("echo \"$0\" > {}", opened.display());
        let desktop = automation(dir.path(), &["sh", "-c", &script]);

        let result = desktop
            .open_messaging_app(&OpenRequest {
                url: "https://wa.me/919876543210".to_string(),
                text: "Hello Ravi".to_string(),
                simulate_paste: false,
            })
            .await
            .expect("open");
        assert!(result.success);
        let clip = std::fs::read_to_string(dir.path().join("clip.txt")).expect("clip");
        assert_eq!(clip, "Hello Ravi");
        let url = std::fs::read_to_string(&opened).expect("opened");
        assert_eq!(url.trim(), "whatsapp://send?phone=919876543210");
    }

    #[tokio::test]
    async fn failing_opener_is_reported_not_raised() {
        let dir = tempdir().expect("temp");
        let desktop = automation(dir.path(), &["false"]);
        let result = desktop
            .open_messaging_app(&OpenRequest {
                url: "whatsapp://send?phone=919876543210".to_string(),
                text: "x".to_string(),
                simulate_paste: false,
            })
            .await
            .expect("open");
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn empty_command_is_invalid() {
        let dir = tempdir().expect("temp");
        let desktop = automation(dir.path(), &[]);
        let err = desktop
            .open_messaging_app(&OpenRequest {
                url: "whatsapp://send?phone=1".to_string(),
                text: "x".to_string(),
                simulate_paste: false,
            })
            .await
            .expect_err("empty opener");
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }
}
