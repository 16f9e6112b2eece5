// ABOUTME: Token discovery with precedence chain
// ABOUTME: CLI flag → XDG session file → env var

use crate::{Error, Result};
use std::env;
use std::fs;
use std::path::Path;

pub fn resolve_token(cli_token: Option<String>) -> Result<String> {
    // 1. CLI flag
    if let Some(token) = cli_token {
        return Ok(token);
    }

    // 2. XDG session file
    if let Some(token) = try_xdg_session()? {
        return Ok(token);
    }

    // 3. Environment variable
    if let Ok(token) = env::var("NOTEDOWN_TOKEN") {
        if !token.is_empty() {
            return Ok(token);
        }
    }

    Err(Error::Auth(
        "No API token found. Provide via --token, session file, or NOTEDOWN_TOKEN env var".into(),
    ))
}

fn try_xdg_session() -> Result<Option<String>> {
    let config_home = env::var("XDG_CONFIG_HOME").unwrap_or_else(|_| {
        let home = env::var("HOME").unwrap_or_default();
        format!("{}/.config", home)
    });

    let path = Path::new(&config_home).join("notedown/session.json");
    parse_session_file(&path)
}

fn parse_session_file(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(path)?;
    let json: serde_json::Value = serde_json::from_str(&content)?;

    Ok(json
        .get("token")
        .and_then(|t| t.as_str())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string()))
}
