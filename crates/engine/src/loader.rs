//! Model and tokenizer loading
//!
//! This module resolves HuggingFace-layout artifacts in a model directory and
//! builds the model on the selected device. Loading runs once at startup; any
//! failure is a load error and the service must not start.

use crate::device::{detect_execution_config, Capabilities};
use crate::generation::{GenerationParams, ModelInfo, TextGenerator};
use crate::model::{ensure_flash_attn_supported, Architecture, LanguageModel};
use candle_core::Device;
use candle_nn::VarBuilder;
use chatserve_common::config::{GenerationConfig, ModelConfig};
use chatserve_common::{ChatServeError, Result};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";
const GENERATION_CONFIG_FILE: &str = "generation_config.json";

/// Tokens treated as end-of-sequence when `generation_config.json` names none
const FALLBACK_EOS_TOKENS: [&str; 3] = ["<eos>", "</s>", "<|endoftext|>"];

/// Artifact files found in a model directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifacts {
    /// Model directory
    pub root: PathBuf,

    /// Architecture description
    pub config: PathBuf,

    /// Tokenizer definition
    pub tokenizer: PathBuf,

    /// Safetensors weight shards, sorted
    pub weights: Vec<PathBuf>,

    /// Generation defaults, if shipped
    pub generation_config: Option<PathBuf>,
}

#[derive(Deserialize)]
struct WeightsIndex {
    weight_map: HashMap<String, String>,
}

#[derive(Deserialize)]
struct GenerationDefaults {
    #[serde(default)]
    eos_token_id: Option<EosTokenId>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EosTokenId {
    Single(u32),
    Many(Vec<u32>),
}

fn require_file(path: PathBuf) -> Result<PathBuf> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(ChatServeError::load(format!("Missing model artifact {}", path.display())))
    }
}

impl ModelArtifacts {
    /// Locate artifacts in `root`
    pub fn discover<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(ChatServeError::load(format!(
                "Model path {} is not a directory",
                root.display()
            )));
        }

        let config = require_file(root.join(CONFIG_FILE))?;
        let tokenizer = require_file(root.join(TOKENIZER_FILE))?;
        let weights = Self::weight_files(root)?;

        let generation_config = Some(root.join(GENERATION_CONFIG_FILE)).filter(|p| p.is_file());

        Ok(Self {
            root: root.to_path_buf(),
            config,
            tokenizer,
            weights,
            generation_config,
        })
    }

    fn weight_files(root: &Path) -> Result<Vec<PathBuf>> {
        let index_path = root.join(WEIGHTS_INDEX_FILE);

        let weights: Vec<PathBuf> = if index_path.is_file() {
            let index: WeightsIndex = serde_json::from_str(&std::fs::read_to_string(&index_path)?)
                .map_err(|e| ChatServeError::load(format!("Malformed {}: {}", WEIGHTS_INDEX_FILE, e)))?;

            index
                .weight_map
                .into_values()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(|file| require_file(root.join(file)))
                .collect::<Result<_>>()?
        } else {
            let mut files: Vec<PathBuf> = std::fs::read_dir(root)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "safetensors"))
                .collect();
            files.sort();
            files
        };

        if weights.is_empty() {
            return Err(ChatServeError::load(format!(
                "No safetensors weights in {}",
                root.display()
            )));
        }

        Ok(weights)
    }

    /// Name reported for the model: the directory name
    pub fn model_id(&self) -> String {
        self.root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.root.display().to_string())
    }
}

/// Resolve end-of-sequence token ids from `generation_config.json`, falling
/// back to well-known EOS tokens in the vocabulary.
pub fn resolve_eos_tokens(generation_config: Option<&Path>, tokenizer: &Tokenizer) -> Result<Vec<u32>> {
    if let Some(path) = generation_config {
        let defaults: GenerationDefaults = serde_json::from_str(&std::fs::read_to_string(path)?)
            .map_err(|e| ChatServeError::load(format!("Malformed {}: {}", GENERATION_CONFIG_FILE, e)))?;

        match defaults.eos_token_id {
            Some(EosTokenId::Single(id)) => return Ok(vec![id]),
            Some(EosTokenId::Many(ids)) if !ids.is_empty() => return Ok(ids),
            _ => {}
        }
    }

    let ids: Vec<u32> = FALLBACK_EOS_TOKENS
        .iter()
        .filter_map(|token| tokenizer.token_to_id(token))
        .collect();

    if ids.is_empty() {
        warn!("No end-of-sequence token found, generation always runs to the token cap");
    }

    Ok(ids)
}

/// A model, tokenizer and placement ready to serve
pub struct LoadedModel {
    pub model: LanguageModel,
    pub tokenizer: Tokenizer,
    pub device: Device,
    pub eos_token_ids: Vec<u32>,
    pub info: ModelInfo,
    pub load_duration: Duration,
}

impl LoadedModel {
    /// Turn the loaded handles into a request-serving generator
    pub fn into_generator(self, generation: &GenerationConfig) -> TextGenerator<LanguageModel> {
        TextGenerator::new(
            self.model,
            self.tokenizer,
            self.device,
            self.eos_token_ids,
            GenerationParams::from(generation),
            self.info,
        )
    }
}

/// Load the model described by `config` onto the best device `capabilities` allow
pub fn load_model(config: &ModelConfig, capabilities: Capabilities) -> Result<LoadedModel> {
    let start = Instant::now();
    info!("Loading model and tokenizer from {}", config.path.display());
    ensure_flash_attn_supported(config.use_flash_attn)?;

    let artifacts = ModelArtifacts::discover(&config.path)?;
    debug!("Resolved {} weight file(s)", artifacts.weights.len());

    let execution = detect_execution_config(capabilities, config.device, config.precision)?;
    info!("Execution config: device={}, precision={}", execution.device, execution.precision);

    let tokenizer = Tokenizer::from_file(&artifacts.tokenizer)
        .map_err(|e| ChatServeError::load(format!("Failed to load tokenizer: {}", e)))?;

    let config_json = std::fs::read_to_string(&artifacts.config)?;
    let architecture = Architecture::from_config_json(&config_json)?;

    let device = execution.device.open()?;

    // SAFETY: weight files are memory-mapped read-only and must not be
    // modified while the service runs.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&artifacts.weights, execution.precision.dtype(), &device) }
        .map_err(|e| ChatServeError::load(format!("Failed to map weights: {}", e)))?;

    let model = LanguageModel::new(architecture, &config_json, config.use_flash_attn, vb)?;
    let eos_token_ids = resolve_eos_tokens(artifacts.generation_config.as_deref(), &tokenizer)?;

    let info = ModelInfo::new(artifacts.model_id(), architecture, execution);
    let load_duration = start.elapsed();

    info!(
        "Model {} ({}) loaded in {:.2}s",
        info.model_id,
        architecture,
        load_duration.as_secs_f64()
    );

    Ok(LoadedModel {
        model,
        tokenizer,
        device,
        eos_token_ids,
        info,
        load_duration,
    })
}
