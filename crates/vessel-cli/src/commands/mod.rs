pub mod launch;
pub mod oci;

use std::path::Path;
use vessel_schema::Settings;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;

const CONFIG_PREFIXES: [&str; 3] = [
    "configuration error:",
    "settings error:",
    "invalid container id",
];

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn load_settings(path: Option<&Path>) -> Result<Settings, String> {
    match path {
        Some(p) => Settings::load(p),
        None => Settings::load_default(),
    }
    .map_err(|e| format!("settings error: {e}"))
}

/// Whether an error message reports bad user input rather than a failure.
pub fn is_config_message(msg: &str) -> bool {
    CONFIG_PREFIXES.iter().any(|p| msg.starts_with(p))
}

/// Container exit codes outside the byte range collapse to a plain failure.
pub fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(EXIT_FAILURE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_pretty_serializes_value() {
        let val = serde_json::json!({"status": "created"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"status\": \"created\""));
    }

    #[test]
    fn config_messages_are_recognized() {
        assert!(is_config_message("configuration error: bad bind"));
        assert!(is_config_message("settings error: failed to parse settings"));
        assert!(is_config_message("invalid container id '../x'"));
        assert!(!is_config_message("runtime error: create failed"));
    }

    #[test]
    fn exit_status_clamps() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(137), 137);
        assert_eq!(exit_status(-1), EXIT_FAILURE);
        assert_eq!(exit_status(300), EXIT_FAILURE);
    }

    #[test]
    fn missing_settings_file_is_a_settings_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_settings(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(is_config_message(&err));
    }
}
