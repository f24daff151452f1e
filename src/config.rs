//! Configuration types for nano-parallel.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Built-in system prompt shared by every simulated client.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"Transcript of a never ending dialog, where the User interacts with an Assistant.
The Assistant is helpful, kind, honest, good at writing, and never fails to answer the User's requests immediately and with precision.

User: Recommend a nice restaurant in the area.
Assistant: I recommend the restaurant "The Golden Duck". It is a 5 star restaurant with a great view of the city. The food is delicious and the service is excellent. The prices are reasonable and the portions are generous. The restaurant is located at 123 Main Street, New York, NY 10001. The phone number is (212) 555-1234. The hours are Monday through Friday from 11:00 am to 10:00 pm. The restaurant is closed on Saturdays and Sundays.
User: Who is Richard Feynman?
Assistant: Richard Feynman was an American physicist who is best known for his work in quantum mechanics and particle physics. He was awarded the Nobel Prize in Physics in 1965 for his contributions to the development of quantum electrodynamics. He was a popular lecturer and author, and he wrote several books, including "Surely You're Joking, Mr. Feynman!" and "What Do You Care What Other People Think?".
User:"#;

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of simultaneous clients (size of the slot pool).
    pub n_parallel: usize,
    /// Maximum number of work items to serve.
    pub n_sequences: usize,
    /// Admit new prompts while other clients are still generating.
    pub cont_batching: bool,
    /// Maximum tokens submitted to the engine per decode call.
    pub n_batch: usize,
    /// Prompt + generated token budget per client (`None` = unlimited).
    pub n_predict: Option<usize>,
    /// Marker that ends a response; stripped from the stored text.
    pub reverse_prompt: Option<String>,
    /// Retire a client as soon as its response contains a newline.
    pub stop_on_newline: bool,
    /// A client never retires while it has decoded this many tokens or fewer.
    pub min_decoded: usize,
    /// Text appended to every prompt before tokenization.
    pub prompt_suffix: String,
    /// Log the per-sequence cache occupancy before every tick.
    pub dump_kv_cache: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            n_parallel: 4,
            n_sequences: 50,
            cont_batching: true,
            n_batch: 512,
            n_predict: None,
            reverse_prompt: Some("User:".to_string()),
            stop_on_newline: true,
            min_decoded: 2,
            prompt_suffix: "\nAssistant:".to_string(),
            dump_kv_cache: false,
        }
    }
}

impl SchedulerConfig {
    /// Set the number of parallel clients.
    pub fn n_parallel(mut self, n_parallel: usize) -> Self {
        self.n_parallel = n_parallel;
        self
    }

    /// Set the maximum number of work items.
    pub fn n_sequences(mut self, n_sequences: usize) -> Self {
        self.n_sequences = n_sequences;
        self
    }

    /// Enable or disable continuous batching.
    pub fn cont_batching(mut self, enabled: bool) -> Self {
        self.cont_batching = enabled;
        self
    }

    /// Set the decode chunk size.
    pub fn n_batch(mut self, n_batch: usize) -> Self {
        self.n_batch = n_batch;
        self
    }

    /// Set the prompt + generation token budget.
    pub fn n_predict(mut self, n_predict: Option<usize>) -> Self {
        self.n_predict = n_predict;
        self
    }

    /// Set the reverse prompt marker.
    pub fn reverse_prompt(mut self, marker: Option<String>) -> Self {
        self.reverse_prompt = marker;
        self
    }

    /// Check the configuration for values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.n_parallel == 0 {
            return Err(Error::Config("n_parallel must be at least 1".into()));
        }
        if self.n_batch == 0 {
            return Err(Error::Config("n_batch must be at least 1".into()));
        }
        if matches!(self.reverse_prompt.as_deref(), Some("")) {
            return Err(Error::Config("reverse prompt cannot be empty".into()));
        }
        Ok(())
    }
}

/// Sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Penalty applied to recently accepted tokens (1.0 = disabled).
    pub repeat_penalty: f32,
    /// Number of accepted tokens the repeat penalty looks back over.
    pub repeat_last_n: usize,
    /// RNG seed; each client derives its own seed from it.
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
            seed: None,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Local model directory or HuggingFace model ID.
    pub model: String,
    /// Hub revision used when `model` is not a local directory.
    pub revision: String,
    /// Context size: number of cache cells shared by all sequences.
    pub n_ctx: usize,
    /// Force CPU execution even when an accelerator is available.
    pub cpu: bool,
    /// Weight dtype ("f32", "f16", "bf16").
    pub dtype: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: "TinyLlama/TinyLlama-1.1B-Chat-v1.0".to_string(),
            revision: "main".to_string(),
            n_ctx: 4096,
            cpu: false,
            dtype: "f32".to_string(),
        }
    }
}

impl EngineConfig {
    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.n_ctx == 0 {
            return Err(Error::Config("n_ctx must be at least 1".into()));
        }
        if self.model.is_empty() {
            return Err(Error::Config("model must not be empty".into()));
        }
        Ok(())
    }
}

/// All configuration for one run, loadable from a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub scheduler: SchedulerConfig,
    pub sampling: SamplingConfig,
    pub engine: EngineConfig,
}

impl RunConfig {
    /// Load a run configuration from a JSON file; missing fields take defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.engine.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_defaults() {
        let config = SchedulerConfig::default();

        assert_eq!(config.n_parallel, 4);
        assert!(config.cont_batching);
        assert_eq!(config.reverse_prompt.as_deref(), Some("User:"));
        assert_eq!(config.min_decoded, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        assert!(SchedulerConfig::default().n_parallel(0).validate().is_err());
        assert!(SchedulerConfig::default().n_batch(0).validate().is_err());

        let engine = EngineConfig {
            n_ctx: 0,
            ..Default::default()
        };
        assert!(engine.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "scheduler": { "n_parallel": 8 }, "sampling": { "seed": 7 } }"#;
        let config: RunConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.scheduler.n_parallel, 8);
        assert_eq!(config.scheduler.n_batch, 512);
        assert_eq!(config.sampling.seed, Some(7));
        assert_eq!(config.engine.n_ctx, 4096);
    }
}
