use anyhow::Result;
use std::path::PathBuf;

const AGENTRELAY_DIR: &str = ".agentrelay";
const STATE_FILE: &str = "state.json";
const LOGS_DIR: &str = "logs";

/// Environment variable to override the data directory.
const AGENTRELAY_DIR_ENV: &str = "AGENTRELAY_DIR";

/// Resolve the data directory.
/// Priority: AGENTRELAY_DIR env var > ~/.agentrelay/
pub fn resolve_data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(AGENTRELAY_DIR_ENV)
        && !dir.trim().is_empty()
    {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|h| h.join(AGENTRELAY_DIR))
        .ok_or_else(|| anyhow::anyhow!("Failed to determine home directory"))
}

/// Ensure the data directory exists and return its path.
pub fn ensure_data_dir() -> Result<PathBuf> {
    let dir = resolve_data_dir()?;
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Default snapshot path: ~/.agentrelay/state.json
pub fn state_path() -> Result<PathBuf> {
    Ok(resolve_data_dir()?.join(STATE_FILE))
}

/// Get the logs directory: ~/.agentrelay/logs/
pub fn logs_dir() -> Result<PathBuf> {
    let dir = ensure_data_dir()?.join(LOGS_DIR);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
