use batchforge::orchestrator::EngineConfig;
use batchforge::template::ContentTypeConfig;
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub engine: EngineConfig,
    pub llm: LlmConfig,
    pub store: StoreConfig,
    pub checkpoint: CheckpointConfig,
    pub content_types: Vec<ContentTypeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the bearer token
    pub api_key_env: String,
    pub parameters: Map<String, Value>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "BATCHFORGE_API_KEY".to_string(),
            parameters: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub table: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("documents.db"),
            table: "documents".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub dir: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: data_dir().join("checkpoints"),
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(env!("CARGO_PKG_NAME"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            engine: EngineConfig::default(),
            llm: LlmConfig::default(),
            store: StoreConfig::default(),
            checkpoint: CheckpointConfig::default(),
            content_types: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let project_name = env!("CARGO_PKG_NAME");
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config
            .engine
            .validate()
            .map_err(|e| eyre::eyre!("Invalid engine config: {}", e))?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Look up a content type by name
    pub fn content_type(&self, name: &str) -> Result<&ContentTypeConfig> {
        self.content_types.iter().find(|c| c.name == name).ok_or_else(|| {
            let known: Vec<&str> = self.content_types.iter().map(|c| c.name.as_str()).collect();
            eyre::eyre!("Unknown content type '{}' (configured: {})", name, known.join(", "))
        })
    }

    /// Checkpoint file for a content type
    pub fn checkpoint_path(&self, content_type: &str) -> PathBuf {
        self.checkpoint.dir.join(format!("{}.json", content_type))
    }
}
