use serde::de::DeserializeOwned;
use wa_sender_core::CoreError;

/// Invocations of the verifier script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeCommand {
    Number(String),
    ScreenshotTimestamp,
}

impl ProbeCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ProbeCommand::Number(_) => "number",
            ProbeCommand::ScreenshotTimestamp => "screenshot_timestamp",
        }
    }

    pub fn args(&self) -> Vec<String> {
        match self {
            ProbeCommand::Number(number) => vec!["--number".to_string(), number.clone()],
            ProbeCommand::ScreenshotTimestamp => vec!["--screenshot-timestamp".to_string()],
        }
    }
}

/// The JSON object between the first `{` and the last `}` of the output.
/// The script prints progress lines around its result.
pub fn extract_json(stdout: &str) -> Option<&str> {
    let start = stdout.find('{')?;
    let end = stdout.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&stdout[start..=end])
}

pub fn parse_output<T: DeserializeOwned>(stdout: &str) -> Result<T, CoreError> {
    let json = extract_json(stdout)
        .ok_or_else(|| CoreError::Probe("no JSON object in verifier output".to_string()))?;
    Ok(serde_json::from_str(json)?)
}
