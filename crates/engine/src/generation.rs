//! Text generation over a loaded model
//!
//! Each call encodes the prompt, runs autoregressive decoding on a private
//! clone of the model, and decodes the whole sequence (prompt included) back
//! to text.

use crate::device::ExecutionConfig;
use crate::model::{Architecture, CausalLm};
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use chatserve_common::config::GenerationConfig;
use chatserve_common::{ChatServeError, Result};
use serde::Serialize;
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::{debug, trace};

/// Sampling and length parameters applied to every request
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub seed: u64,
}

impl GenerationParams {
    /// Greedy decoding capped at `max_new_tokens`
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            temperature: None,
            top_p: None,
            seed: 0,
        }
    }

    /// Sampling strategy; a missing or zero temperature is greedy
    pub fn sampling(&self) -> Sampling {
        match (self.temperature, self.top_p) {
            (Some(temperature), Some(p)) if temperature > 0.0 => Sampling::TopP { p, temperature },
            (Some(temperature), None) if temperature > 0.0 => Sampling::All { temperature },
            _ => Sampling::ArgMax,
        }
    }
}

impl From<&GenerationConfig> for GenerationParams {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            max_new_tokens: config.max_new_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            seed: config.seed,
        }
    }
}

/// Why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// An end-of-sequence token was produced
    Eos,

    /// The new-token cap was reached
    Length,

    /// The prompt encoded to no tokens, so the model never ran
    EmptyPrompt,
}

/// Result of one generation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Decoded prompt and continuation
    pub text: String,

    /// Number of prompt tokens, special tokens included
    pub prompt_tokens: usize,

    /// Number of newly generated tokens
    pub generated_tokens: usize,

    pub finish_reason: FinishReason,
}

/// Descriptive information about the served model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub architecture: String,
    pub device: String,
    pub precision: String,
}

impl ModelInfo {
    pub fn new(model_id: impl Into<String>, architecture: Architecture, execution: ExecutionConfig) -> Self {
        Self {
            model_id: model_id.into(),
            architecture: architecture.to_string(),
            device: execution.device.to_string(),
            precision: execution.precision.to_string(),
        }
    }
}

/// Text completion backend shared by request handlers
pub trait Generator: Send + Sync {
    /// Complete `prompt`, blocking until generation finishes
    fn generate(&self, prompt: &str) -> Result<Completion>;

    /// Describe the model behind this generator
    fn info(&self) -> &ModelInfo;
}

/// Generator backed by a candle model and a HuggingFace tokenizer
pub struct TextGenerator<M: CausalLm> {
    model: M,
    tokenizer: Tokenizer,
    device: Device,
    eos_token_ids: Vec<u32>,
    params: GenerationParams,
    info: ModelInfo,
}

fn generation_error(stage: &str, err: impl std::fmt::Display) -> ChatServeError {
    ChatServeError::generation(format!("{} failed: {}", stage, err))
}

impl<M: CausalLm> TextGenerator<M> {
    /// Create a new generator
    pub fn new(
        model: M,
        tokenizer: Tokenizer,
        device: Device,
        eos_token_ids: Vec<u32>,
        params: GenerationParams,
        info: ModelInfo,
    ) -> Self {
        Self {
            model,
            tokenizer,
            device,
            eos_token_ids,
            params,
            info,
        }
    }

    fn next_token(
        &self,
        model: &mut M,
        logits_processor: &mut LogitsProcessor,
        context: &[u32],
        offset: usize,
    ) -> candle_core::Result<u32> {
        let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
        let logits = model.forward(&input, offset)?;
        let logits = logits.squeeze(0)?.squeeze(0)?.to_dtype(DType::F32)?;
        logits_processor.sample(&logits)
    }
}

impl<M: CausalLm> Generator for TextGenerator<M> {
    fn generate(&self, prompt: &str) -> Result<Completion> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| generation_error("encode", e))?;
        let mut tokens = encoding.get_ids().to_vec();
        let prompt_tokens = tokens.len();

        if tokens.is_empty() {
            debug!("Prompt encoded to no tokens, skipping generation");
            return Ok(Completion {
                text: String::new(),
                prompt_tokens: 0,
                generated_tokens: 0,
                finish_reason: FinishReason::EmptyPrompt,
            });
        }

        let mut model = self.model.clone();
        model.clear_kv_cache();
        let mut logits_processor = LogitsProcessor::from_sampling(self.params.seed, self.params.sampling());

        let start = Instant::now();
        let mut finish_reason = FinishReason::Length;

        for index in 0..self.params.max_new_tokens {
            // The first step feeds the whole prompt; later steps only the newest token.
            let context_size = if index > 0 { 1 } else { tokens.len() };
            let offset = tokens.len() - context_size;

            let next = self
                .next_token(&mut model, &mut logits_processor, &tokens[offset..], offset)
                .map_err(|e| generation_error("forward", e))?;
            tokens.push(next);
            trace!("Step {} produced token {}", index, next);

            if self.eos_token_ids.contains(&next) {
                finish_reason = FinishReason::Eos;
                break;
            }
        }

        let generated_tokens = tokens.len() - prompt_tokens;
        let elapsed = start.elapsed();
        debug!(
            "Generated {} tokens in {:?} ({:.2} tok/s), finish={:?}",
            generated_tokens,
            elapsed,
            generated_tokens as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
            finish_reason
        );

        let text = self
            .tokenizer
            .decode(&tokens, true)
            .map_err(|e| generation_error("decode", e))?;

        Ok(Completion {
            text,
            prompt_tokens,
            generated_tokens,
            finish_reason,
        })
    }

    fn info(&self) -> &ModelInfo {
        &self.info
    }
}
