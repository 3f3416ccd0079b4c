//! ChatServe Engine
//!
//! Loads a pretrained causal language model with its tokenizer and runs
//! text generation on CPU or an accelerator through candle.

pub mod device;
pub mod generation;
pub mod loader;
pub mod model;

pub use device::{detect_execution_config, Capabilities, DeviceKind, ExecutionConfig, Precision};
pub use generation::{Completion, FinishReason, GenerationParams, Generator, ModelInfo, TextGenerator};
pub use loader::{load_model, LoadedModel, ModelArtifacts};
pub use model::{Architecture, CausalLm, LanguageModel};
