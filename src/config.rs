use crate::agent::Viewport;
use crate::retry::RetryPolicy;
use crate::scoring::ScoringConfig;
use anyhow::{Context, Result, bail};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

/// Connection settings for one OpenAI-compatible model endpoint
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelSettings {
    /// API endpoint
    pub api_endpoint: String,
    /// Environment variable name containing the API key
    pub env_var_api_key: String,
    /// Model identifier
    pub model: String,
    /// Maximum output tokens per request
    pub max_tokens: u32,
    /// Sampling temperature for calls outside the retry loop
    pub temperature: f64,
    /// Rate limit for API requests per second, 0 disables limiting
    pub rate_limit_rps: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            api_endpoint: "https://api.openai.com/v1".to_string(),
            env_var_api_key: "OPENAI_API_KEY".to_string(),
            model: "gpt-4o".to_string(),
            max_tokens: 16384,
            temperature: 0.0,
            rate_limit_rps: 10.0,
        }
    }
}

impl ModelSettings {
    /// Defaults of the `[agent_model]` section
    pub fn agent() -> Self {
        Self {
            model: "ui-tars".to_string(),
            max_tokens: 3000,
            ..Self::default()
        }
    }
}

/// Fill a partial `[agent_model]` table from the agent defaults.
fn agent_model_section<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<ModelSettings, D::Error> {
    let given = toml::Table::deserialize(deserializer)?;
    let mut merged = toml::Value::try_from(ModelSettings::agent()).map_err(D::Error::custom)?;
    if let toml::Value::Table(table) = &mut merged {
        table.extend(given);
    }
    merged.try_into().map_err(D::Error::custom)
}

/// Batch fan-out settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Concurrent in-flight items
    pub concurrency: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self { concurrency: 50 }
    }
}

/// Step budgets of the agent per task type
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StepLimits {
    #[serde(rename = "static")]
    pub static_: usize,
    pub intention: usize,
    pub basic: usize,
    pub complex: usize,
}

impl Default for StepLimits {
    fn default() -> Self {
        Self {
            static_: 6,
            intention: 15,
            basic: 5,
            complex: 15,
        }
    }
}

/// GUI agent track settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentSettings {
    pub max_steps: StepLimits,
    /// Lines of the flattened static branch per static task
    pub static_chunk_lines: usize,
    /// Screenshots kept in the conversation sent to the agent model
    pub max_image_history: usize,
    /// Language the agent writes its thoughts in
    pub language: String,
    /// Scale of the coordinates the agent model emits
    pub coordinate_factor: f64,
    pub viewport: Viewport,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_steps: StepLimits::default(),
            static_chunk_lines: 10,
            max_image_history: 5,
            language: "English".to_string(),
            coordinate_factor: 1000.0,
            viewport: Viewport::default(),
        }
    }
}

/// Root configuration of a run
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Judge and rubric generation endpoint
    pub model: ModelSettings,
    /// GUI agent endpoint
    #[serde(deserialize_with = "agent_model_section")]
    pub agent_model: ModelSettings,
    pub retry: RetryPolicy,
    pub batch: BatchSettings,
    pub scoring: ScoringConfig,
    pub agent: AgentSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: ModelSettings::default(),
            agent_model: ModelSettings::agent(),
            retry: RetryPolicy::default(),
            batch: BatchSettings::default(),
            scoring: ScoringConfig::default(),
            agent: AgentSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, otherwise use the defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Reject values no run can work with
    pub fn validate(&self) -> Result<()> {
        for (name, threshold) in [
            ("threshold", self.scoring.threshold),
            ("likert_threshold", self.scoring.likert_threshold),
        ] {
            if !threshold.is_finite() || threshold < 0.0 {
                bail!("scoring.{name} must be a finite non-negative number, got {threshold}");
            }
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.agent.static_chunk_lines == 0 {
            bail!("agent.static_chunk_lines must be at least 1");
        }
        if self.agent.coordinate_factor.is_nan() || self.agent.coordinate_factor <= 0.0 {
            bail!("agent.coordinate_factor must be positive");
        }
        Ok(())
    }

    /// Worker count with the lower bound applied
    pub fn concurrency(&self) -> usize {
        self.batch.concurrency.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", content).unwrap();
        temp_file
    }

    #[test]
    fn test_config_parsing() {
        let temp_file = write_config(
            r#"
[model]
api_endpoint = "http://localhost:8000/v1"
env_var_api_key = "JUDGE_KEY"
model = "judge-large"
max_tokens = 8000
rate_limit_rps = 2.5

[agent_model]
model = "ui-agent"

[retry]
max_attempts = 3
temperature_step = 0.2

[batch]
concurrency = 64

[scoring]
threshold = 0.5

[scoring.weights]
dynamic = 2.0

[agent]
static_chunk_lines = 12
viewport = { width = 1280, height = 720 }

[agent.max_steps]
complex = 20
"#,
        );

        let config = Config::from_file(temp_file.path()).unwrap();
        assert_eq!(config.model.model, "judge-large");
        assert_eq!(config.model.max_tokens, 8000);
        assert_eq!(config.model.rate_limit_rps, 2.5);
        assert_eq!(config.agent_model.model, "ui-agent");
        assert_eq!(config.agent_model.max_tokens, 3000);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.temperature_step, 0.2);
        assert_eq!(config.retry.initial_temperature, 0.0);
        assert_eq!(config.concurrency(), 64);
        assert_eq!(config.scoring.threshold, 0.5);
        assert_eq!(config.scoring.weights.dynamic, 2.0);
        assert_eq!(config.scoring.weights.static_, 1.0);
        assert_eq!(config.agent.static_chunk_lines, 12);
        assert_eq!(config.agent.viewport.width, 1280);
        assert_eq!(config.agent.max_steps.complex, 20);
        assert_eq!(config.agent.max_steps.static_, 6);
    }

    #[test]
    fn test_config_defaults() {
        let temp_file = write_config("");
        let config = Config::from_file(temp_file.path()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.model.max_tokens, 16384);
        assert_eq!(config.model.rate_limit_rps, 10.0);
        assert_eq!(config.agent_model.max_tokens, 3000);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.batch.concurrency, 50);
        assert_eq!(config.agent.max_steps.intention, 15);
        assert_eq!(config.agent.max_image_history, 5);
        assert_eq!(config.agent.language, "English");
        assert_eq!(config.agent.viewport.height, 1080);
    }

    #[test]
    fn test_load_without_path_uses_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.scoring.threshold, 0.0);
        assert_eq!(config.scoring.likert_threshold, 1.0);
    }

    #[test]
    fn test_negative_threshold_is_rejected() {
        let temp_file = write_config("[scoring]\nthreshold = -1.0\n");
        let err = Config::from_file(temp_file.path()).unwrap_err();
        assert!(err.to_string().contains("scoring.threshold"));

        let temp_file = write_config("[scoring]\nlikert_threshold = -0.5\n");
        let err = Config::from_file(temp_file.path()).unwrap_err();
        assert!(err.to_string().contains("scoring.likert_threshold"));
    }

    #[test]
    fn test_zero_attempts_is_rejected() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_concurrency_is_clamped() {
        let mut config = Config::default();
        config.batch.concurrency = 0;
        assert_eq!(config.concurrency(), 1);
    }

    #[test]
    fn test_missing_file() {
        let result = Config::from_file(Path::new("/nonexistent/config.toml"));
        assert!(result.unwrap_err().to_string().contains("Failed to read config file"));
    }
}
