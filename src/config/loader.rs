use std::path::{Path, PathBuf};

use crate::config::types::CmdletConfig;
use crate::error::{CmdletError, Result};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "cmdlet", "cmdlet") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        // Fallback to home directory
        dirs_fallback().join(".cmdlet").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values
pub fn load_config(config_path: Option<&Path>) -> Result<CmdletConfig> {
    let path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(get_config_path);

    if !path.exists() {
        // Return defaults if no config file exists
        return Ok(CmdletConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config: CmdletConfig =
        toml::from_str(&content).map_err(|e| CmdletError::TomlParse(e.to_string()))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/config.toml"))).unwrap();
        assert_eq!(config.server.name, "cmdlet");
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nname = \"cmd.example.com\"").unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.server.name, "cmd.example.com");
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server").unwrap();

        assert!(matches!(
            load_config(Some(file.path())).unwrap_err(),
            CmdletError::TomlParse(_)
        ));
    }
}
