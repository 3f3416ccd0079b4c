//! Causal language model handles
//!
//! A loaded model is shared read-only across requests. Generation works on
//! a clone: candle tensors are reference counted, so cloning shares the
//! weights while giving the clone its own KV cache.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use candle_transformers::models::{gemma, gemma2};
use chatserve_common::{ChatServeError, Result};
use serde::Deserialize;
use std::fmt;

/// Autoregressive model interface used by the generation loop
pub trait CausalLm: Clone + Send + Sync {
    /// Run the model over `input_ids` (shape `[1, seq_len]`) starting at
    /// position `seqlen_offset`, returning last-position logits of shape
    /// `[1, 1, vocab]`.
    fn forward(&mut self, input_ids: &Tensor, seqlen_offset: usize) -> candle_core::Result<Tensor>;

    /// Drop any cached keys and values
    fn clear_kv_cache(&mut self);
}

/// Supported model architectures, keyed by `model_type` in `config.json`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    Gemma,
    Gemma2,
}

#[derive(Deserialize)]
struct ModelTypeProbe {
    model_type: Option<String>,
}

impl Architecture {
    /// Read the architecture from the contents of `config.json`
    pub fn from_config_json(json: &str) -> Result<Self> {
        let probe: ModelTypeProbe = serde_json::from_str(json)
            .map_err(|e| ChatServeError::load(format!("Malformed config.json: {}", e)))?;

        match probe.model_type.as_deref() {
            Some("gemma") => Ok(Architecture::Gemma),
            Some("gemma2") => Ok(Architecture::Gemma2),
            Some(other) => Err(ChatServeError::load(format!(
                "Unsupported model_type {:?}",
                other
            ))),
            None => Err(ChatServeError::load("config.json has no model_type")),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::Gemma => f.write_str("gemma"),
            Architecture::Gemma2 => f.write_str("gemma2"),
        }
    }
}

/// A loaded language model
#[derive(Clone)]
pub enum LanguageModel {
    Gemma(gemma::Model),
    Gemma2(gemma2::Model),
}

impl LanguageModel {
    /// Build the model for `architecture` from its `config.json` and weights
    pub fn new(
        architecture: Architecture,
        config_json: &str,
        use_flash_attn: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        ensure_flash_attn_supported(use_flash_attn)?;

        match architecture {
            Architecture::Gemma => {
                let config: gemma::Config = serde_json::from_str(config_json)
                    .map_err(|e| ChatServeError::load(format!("Invalid gemma config: {}", e)))?;
                gemma::Model::new(use_flash_attn, &config, vb)
                    .map(LanguageModel::Gemma)
                    .map_err(|e| ChatServeError::load(format!("Failed to build gemma model: {}", e)))
            }
            Architecture::Gemma2 => {
                let config: gemma2::Config = serde_json::from_str(config_json)
                    .map_err(|e| ChatServeError::load(format!("Invalid gemma2 config: {}", e)))?;
                gemma2::Model::new(use_flash_attn, &config, vb)
                    .map(LanguageModel::Gemma2)
                    .map_err(|e| ChatServeError::load(format!("Failed to build gemma2 model: {}", e)))
            }
        }
    }

}

/// Fail when flash attention is requested from a build without its kernels
pub fn ensure_flash_attn_supported(use_flash_attn: bool) -> Result<()> {
    if use_flash_attn && !cfg!(feature = "flash-attn") {
        return Err(ChatServeError::load(
            "use_flash_attn requires a build with the `flash-attn` feature",
        ));
    }
    Ok(())
}

impl CausalLm for LanguageModel {
    fn forward(&mut self, input_ids: &Tensor, seqlen_offset: usize) -> candle_core::Result<Tensor> {
        match self {
            LanguageModel::Gemma(model) => model.forward(input_ids, seqlen_offset),
            LanguageModel::Gemma2(model) => model.forward(input_ids, seqlen_offset),
        }
    }

    fn clear_kv_cache(&mut self) {
        match self {
            LanguageModel::Gemma(model) => model.clear_kv_cache(),
            LanguageModel::Gemma2(model) => model.clear_kv_cache(),
        }
    }
}
