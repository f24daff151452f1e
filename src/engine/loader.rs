//! Model file resolution and weight loading.
//!
//! A model is either a local directory holding `config.json`,
//! `tokenizer.json` and SafeTensors weights, or a HuggingFace Hub id that is
//! downloaded (and cached) on first use.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::LlamaConfig;
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use tracing::info;

use crate::error::{Error, Result};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Paths to the files a model needs.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    /// Path to config.json.
    pub config: PathBuf,
    /// Paths to weight files (SafeTensors).
    pub weights: Vec<PathBuf>,
    /// Path to tokenizer.json.
    pub tokenizer: PathBuf,
}

/// Locate model files in a local directory, or download them from the hub.
pub fn resolve_model(model: &str, revision: &str) -> Result<ModelFiles> {
    let local = Path::new(model);
    if local.is_dir() {
        info!(path = %local.display(), "loading model from local directory");
        return local_model(local);
    }

    info!(model, revision, "fetching model from the hub");
    download_model(model, revision)
}

fn local_model(dir: &Path) -> Result<ModelFiles> {
    let require = |name: &str| {
        let path = dir.join(name);
        if path.is_file() {
            Ok(path)
        } else {
            Err(Error::ModelLoad(format!("missing {}", path.display())))
        }
    };

    let config = require(CONFIG_FILE)?;
    let tokenizer = require(TOKENIZER_FILE)?;

    let single = dir.join(SINGLE_WEIGHTS_FILE);
    let weights = if single.is_file() {
        vec![single]
    } else {
        let index = require(WEIGHTS_INDEX_FILE)?;
        shard_names(&index)?
            .into_iter()
            .map(|name| dir.join(name))
            .collect()
    };

    Ok(ModelFiles {
        config,
        weights,
        tokenizer,
    })
}

fn download_model(model_id: &str, revision: &str) -> Result<ModelFiles> {
    let api = Api::new().map_err(|e| Error::ModelLoad(format!("failed to create HF API: {e}")))?;
    let repo = api.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));

    let get = |name: &str| {
        repo.get(name)
            .map_err(|e| Error::ModelLoad(format!("failed to download {name}: {e}")))
    };

    Ok(ModelFiles {
        config: get(CONFIG_FILE)?,
        weights: download_weights(&repo)?,
        tokenizer: get(TOKENIZER_FILE)?,
    })
}

fn download_weights(repo: &ApiRepo) -> Result<Vec<PathBuf>> {
    if let Ok(path) = repo.get(SINGLE_WEIGHTS_FILE) {
        return Ok(vec![path]);
    }

    let index = repo.get(WEIGHTS_INDEX_FILE).map_err(|_| {
        Error::ModelLoad("no SafeTensors weights found; only SafeTensors is supported".into())
    })?;

    shard_names(&index)?
        .into_iter()
        .map(|name| {
            repo.get(&name)
                .map_err(|e| Error::ModelLoad(format!("failed to download {name}: {e}")))
        })
        .collect()
}

/// Unique shard file names listed in a SafeTensors index, sorted.
fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(index_path)?;
    let index: serde_json::Value = serde_json::from_str(&content)?;

    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| Error::ModelLoad("invalid SafeTensors index: missing weight_map".into()))?;

    let mut shards: Vec<String> = weight_map
        .values()
        .filter_map(|v| v.as_str())
        .map(str::to_string)
        .collect();
    shards.sort();
    shards.dedup();
    Ok(shards)
}

/// Read a Llama-family `config.json`.
pub fn load_llama_config(path: &Path) -> Result<LlamaConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::ModelLoad(format!("failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| Error::ModelLoad(format!("failed to parse {}: {e}", path.display())))
}

/// Memory-map SafeTensors weights into a `VarBuilder`.
///
/// # Safety
///
/// The files must not be modified while mapped.
#[allow(unsafe_code)]
pub fn load_safetensors(
    paths: &[PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

/// Parse a dtype name.
pub fn parse_dtype(name: &str) -> Result<DType> {
    match name.to_ascii_lowercase().as_str() {
        "f32" => Ok(DType::F32),
        "f16" => Ok(DType::F16),
        "bf16" => Ok(DType::BF16),
        other => Err(Error::Config(format!("unsupported dtype: {other}"))),
    }
}
