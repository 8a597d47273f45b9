use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::chat_manager::{ToolMode, TurnSettings};
use crate::error::ChatError;
use crate::protocol::ModelParams;

pub const SERVER_URL_ENV: &str = "CHATFLOW_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub enabled_tools: Vec<String>,
    #[serde(default)]
    pub params: ModelParams,
    #[serde(default)]
    pub tool_mode: ToolMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            model_id: None,
            enabled_tools: Vec::new(),
            params: ModelParams::default(),
            tool_mode: ToolMode::default(),
        }
    }
}

impl ClientConfig {
    pub fn turn_settings(&self) -> TurnSettings {
        TurnSettings {
            model_id: self.model_id.clone(),
            enabled_tools: self.enabled_tools.clone(),
            params: self.params.clone(),
            mode: self.tool_mode,
        }
    }
}

fn default_server_url() -> String {
    // Check environment variable first, then fall back to localhost
    std::env::var(SERVER_URL_ENV).unwrap_or_else(|_| "http://127.0.0.1:5000".to_string())
}

pub fn default_config_path() -> PathBuf {
    let Some(dirs) = ProjectDirs::from("com", "chatflow", "chatflow") else {
        return Path::new("chatflow.json").to_path_buf();
    };
    dirs.config_dir().join("config.json")
}

/// Missing or unreadable files yield the defaults.
pub fn load_config(path: &Path) -> ClientConfig {
    let Ok(bytes) = fs::read(path) else {
        return ClientConfig::default();
    };
    match serde_json::from_slice::<ClientConfig>(&bytes) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(path = %path.display(), "ignoring unreadable config: {}", e);
            ClientConfig::default()
        }
    }
}

pub fn save_config(path: &Path, cfg: &ClientConfig) -> Result<(), ChatError> {
    let json = serde_json::to_vec_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ChatError::Config(e.to_string()))?;
    }
    fs::write(path, json).map_err(|e| ChatError::Config(e.to_string()))
}
