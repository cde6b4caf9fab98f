use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use wa_sender_core::settings::{SendTimings, VerificationTimings};
use wa_sender_core::CoreError;

pub const CONFIG_FILE: &str = "config.toml";
const APP_DIR: &str = "wa-sender";

/// Operator configuration read from `config.toml`. Every field is optional in
/// the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub python: String,
    pub verifier_script: PathBuf,
    /// Program and leading args used to open a protocol URL.
    pub opener: Vec<String>,
    /// Receives the message text on stdin before the client is opened.
    pub clipboard_command: Vec<String>,
    pub paste_command: Vec<String>,
    pub send_command: Vec<String>,
    pub keystroke_delay_ms: u64,
    pub app_process_name: String,
    pub send: SendTimings,
    pub verification: VerificationTimings,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|base| base.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(APP_DIR))
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for AppConfig {
    fn default() -> Self {
        let (opener, clipboard_command, paste_command, send_command, python) = if cfg!(windows) {
            (
                strings(&["cmd", "/C", "start", ""]),
                strings(&["clip"]),
                strings(&["cscript", "//nologo", "scripts/paste.vbs"]),
                strings(&["cscript", "//nologo", "scripts/send.vbs"]),
                "python".to_string(),
            )
        } else if cfg!(target_os = "macos") {
            (
                strings(&["open"]),
                strings(&["pbcopy"]),
                strings(&["osascript", "-e", "tell application \"System Events\" to keystroke \"v\" using command down"]),
                strings(&["osascript", "-e", "tell application \"System Events\" to key code 36"]),
                "python3".to_string(),
            )
        } else {
            (
                strings(&["xdg-open"]),
                strings(&["xclip", "-selection", "clipboard"]),
                strings(&["xdotool", "key", "ctrl+v"]),
                strings(&["xdotool", "key", "Return"]),
                "python3".to_string(),
            )
        };
        Self {
            data_dir: default_data_dir(),
            python,
            verifier_script: PathBuf::from("scripts/python/verify.py"),
            opener,
            clipboard_command,
            paste_command,
            send_command,
            keystroke_delay_ms: 3_000,
            app_process_name: if cfg!(windows) { "WhatsApp.exe" } else { "WhatsApp" }.to_string(),
            send: SendTimings::default(),
            verification: VerificationTimings::default(),
        }
    }
}

impl AppConfig {
    /// Reads `path`, or returns defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .map_err(|e| CoreError::InvalidArgument(format!("read {}: {}", path.display(), e)))?;
        toml::from_str(&raw).map_err(|e| CoreError::InvalidArgument(format!("parse {}: {}", path.display(), e)))
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("queue.sqlite")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// The kill command for the messaging client process.
    pub fn kill_command(&self) -> Vec<String> {
        if cfg!(windows) {
            strings(&["taskkill", "/F", "/IM", &self.app_process_name])
        } else {
            strings(&["pkill", "-x", &self.app_process_name])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().expect("temp");
        let config = AppConfig::load(&dir.path().join(CONFIG_FILE)).expect("load");
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let dir = tempdir().expect("temp");
        let path = dir.path().join(CONFIG_FILE);
        fs::write(
            &path,
            "python = \"/opt/py/bin/python\"\nkeystroke_delay_ms = 1000\n\n[send]\nstep_hold_ms = 200\n",
        )
        .expect("write");
        let config = AppConfig::load(&path).expect("load");
        assert_eq!(config.python, "/opt/py/bin/python");
        assert_eq!(config.keystroke_delay_ms, 1000);
        assert_eq!(config.send.step_hold_ms, 200);
        assert_eq!(config.send.settle_ms, SendTimings::default().settle_ms);
        assert_eq!(config.verification, VerificationTimings::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempdir().expect("temp");
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "python = [").expect("write");
        assert!(AppConfig::load(&path).is_err());
    }
}
