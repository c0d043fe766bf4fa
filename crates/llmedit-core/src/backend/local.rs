//! In-process GGUF session.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::{GenerationRequest, GenerationResponse, ModelBackend, ModelError, ModelInformation};

const TOKENIZER_FILE: &str = "tokenizer.json";

/// A model whose weights live in this process.
///
/// The loaded runtime sits in an `Option`; unloading takes it out and drops
/// it, so load/unload cycles never accumulate resources.
pub struct LocalSession {
    info: ModelInformation,
    models_dir: PathBuf,
    runtime: Option<runtime::LoadedModel>,
}

impl LocalSession {
    pub fn new(info: ModelInformation, models_dir: impl Into<PathBuf>) -> Self {
        let models_dir = models_dir.into();
        debug!(model = %info.name, file = %info.file_name, "local session created");
        Self {
            info,
            models_dir,
            runtime: None,
        }
    }

    pub fn model_path(&self) -> PathBuf {
        self.models_dir.join(&self.info.file_name)
    }

    /// First existing candidate: the configured tokenizer file, then
    /// `tokenizer.json` next to the weights, then in the models directory.
    pub fn tokenizer_path(&self) -> Option<PathBuf> {
        let model_path = self.model_path();
        let beside_model = model_path
            .parent()
            .unwrap_or(Path::new("."))
            .join(TOKENIZER_FILE);

        self.info
            .tokenizer_file
            .as_ref()
            .map(|file| self.models_dir.join(file))
            .into_iter()
            .chain([beside_model, self.models_dir.join(TOKENIZER_FILE)])
            .find(|candidate| candidate.is_file())
    }

    fn load_error(&self, source: anyhow::Error) -> ModelError {
        ModelError::Load {
            model: self.info.name.clone(),
            source,
        }
    }
}

impl fmt::Debug for LocalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSession")
            .field("model", &self.info.name)
            .field("models_dir", &self.models_dir)
            .field("loaded", &self.runtime.is_some())
            .finish()
    }
}

impl ModelBackend for LocalSession {
    fn model_info(&self) -> &ModelInformation {
        &self.info
    }

    fn is_loaded(&self) -> bool {
        self.runtime.is_some()
    }

    fn load(&mut self) -> Result<(), ModelError> {
        if self.runtime.is_some() {
            debug!(model = %self.info.name, "model already loaded");
            return Ok(());
        }

        let model_path = self.model_path();
        if !model_path.is_file() {
            return Err(self.load_error(anyhow::anyhow!(
                "model file not found: {}",
                model_path.display()
            )));
        }
        let tokenizer_path = self.tokenizer_path().ok_or_else(|| {
            self.load_error(anyhow::anyhow!(
                "no {TOKENIZER_FILE} found for {}",
                model_path.display()
            ))
        })?;

        info!(
            model = %self.info.name,
            path = %model_path.display(),
            tokenizer = %tokenizer_path.display(),
            "loading model"
        );
        let loaded = runtime::LoadedModel::load(&model_path, &tokenizer_path)
            .map_err(|source| self.load_error(source))?;
        self.runtime = Some(loaded);
        info!(model = %self.info.name, "model loaded");
        Ok(())
    }

    fn unload(&mut self) {
        let Some(loaded) = self.runtime.take() else {
            debug!(model = %self.info.name, "no model loaded, nothing to unload");
            return;
        };
        if catch_unwind(AssertUnwindSafe(move || drop(loaded))).is_err() {
            warn!(model = %self.info.name, "model teardown panicked; handle discarded");
        } else {
            info!(model = %self.info.name, "model unloaded");
        }
    }

    fn generate(&mut self, request: &GenerationRequest) -> Result<GenerationResponse, ModelError> {
        if self.runtime.is_none() {
            info!(model = %self.info.name, "model not loaded, loading before generation");
            self.load()?;
        }

        debug!(
            model = %self.info.name,
            system_len = request.system_prompt.len(),
            user_len = request.user_prompt.len(),
            temperature = request.temperature,
            top_k = request.top_k,
            top_p = request.top_p,
            min_p = request.min_p,
            "starting generation"
        );

        let max_tokens = self.info.max_tokens.min(self.info.output_length).max(1);
        let model = self.info.name.clone();
        let Some(loaded) = self.runtime.as_mut() else {
            return Err(ModelError::Generation {
                model,
                source: anyhow::anyhow!("model not loaded"),
            });
        };
        let text = loaded
            .generate(request, max_tokens)
            .map_err(|source| ModelError::Generation {
                model: model.clone(),
                source,
            })?;

        debug!(model = %model, chars = text.chars().count(), "generation finished");
        let metadata = BTreeMap::from([("model_name".to_owned(), model)]);
        Ok(GenerationResponse {
            text,
            metadata,
            request: request.clone(),
        })
    }
}

/// Mask logits whose probability, after temperature scaling, falls below
/// `min_p` times the most likely token's probability.
///
/// Masked entries become `-inf`; a non-positive `min_p` or temperature
/// returns the logits unchanged.
pub fn min_p_mask(logits: &[f32], min_p: f64, temperature: f64) -> Vec<f32> {
    if min_p <= 0.0 || temperature <= 0.0 || logits.is_empty() {
        return logits.to_vec();
    }
    let max = logits
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max) as f64;
    // p_i / p_max == exp((l_i - l_max) / t)
    let floor = min_p.ln();
    logits
        .iter()
        .map(|&logit| {
            if (logit as f64 - max) / temperature >= floor {
                logit
            } else {
                f32::NEG_INFINITY
            }
        })
        .collect()
}

/// New tokens a request may produce: at most `max_tokens`, and never past
/// the end of the context window. `None` when the prompt alone fills it.
#[cfg_attr(not(feature = "candle"), allow(dead_code))]
pub(crate) fn generation_budget(
    prompt_tokens: usize,
    max_tokens: usize,
    context_length: usize,
) -> Option<usize> {
    let room = context_length.checked_sub(prompt_tokens).filter(|room| *room > 0)?;
    Some(room.min(max_tokens))
}

#[cfg(feature = "candle")]
mod runtime {
    use std::fs::File;
    use std::path::Path;

    use anyhow::{Context, Result, bail};
    use candle_core::quantized::gguf_file;
    use candle_core::{DType, Device, Tensor};
    use candle_transformers::generation::{LogitsProcessor, Sampling};
    use candle_transformers::models::{quantized_llama, quantized_qwen2};
    use tokenizers::Tokenizer;

    use tracing::debug;

    use super::{generation_budget, min_p_mask};
    use crate::backend::GenerationRequest;

    const SEED: u64 = 299_792_458;
    /// Used when the GGUF header carries no context length.
    const DEFAULT_CONTEXT_LENGTH: usize = 4096;
    /// The quantized llama kernels cannot attend past this many positions.
    const LLAMA_MAX_SEQ_LEN: usize = 4096;
    const EOS_MARKERS: &[&str] = &[
        "</s>",
        "<|endoftext|>",
        "<|end_of_text|>",
        "<|eot_id|>",
        "<|im_end|>",
        "<end_of_turn>",
    ];

    enum Weights {
        Llama(quantized_llama::ModelWeights),
        Qwen2(quantized_qwen2::ModelWeights),
    }

    impl Weights {
        fn forward(&mut self, input: &Tensor, position: usize) -> Result<Tensor> {
            match self {
                Weights::Llama(model) => Ok(model.forward(input, position)?),
                Weights::Qwen2(model) => Ok(model.forward(input, position)?),
            }
        }
    }

    pub(super) struct LoadedModel {
        weights: Weights,
        tokenizer: Tokenizer,
        device: Device,
        eos_tokens: Vec<u32>,
        context_length: usize,
    }

    impl LoadedModel {
        pub(super) fn load(model_path: &Path, tokenizer_path: &Path) -> Result<Self> {
            let device = Device::Cpu;
            let mut file = File::open(model_path)
                .with_context(|| format!("failed to open {}", model_path.display()))?;
            let content = gguf_file::Content::read(&mut file)
                .with_context(|| format!("failed to read GGUF header of {}", model_path.display()))?;

            let architecture = content
                .metadata
                .get("general.architecture")
                .and_then(|value| value.to_string().ok())
                .cloned()
                .unwrap_or_else(|| "llama".to_owned());
            let mut eos_tokens: Vec<u32> = content
                .metadata
                .get("tokenizer.ggml.eos_token_id")
                .and_then(|value| value.to_u32().ok())
                .into_iter()
                .collect();
            let mut context_length = content
                .metadata
                .get(&format!("{architecture}.context_length"))
                .and_then(|value| value.to_u32().ok())
                .map(|len| len as usize)
                .unwrap_or(DEFAULT_CONTEXT_LENGTH);

            let weights = match architecture.as_str() {
                "llama" | "mistral" => Weights::Llama(
                    quantized_llama::ModelWeights::from_gguf(content, &mut file, &device)
                        .context("failed to build llama weights")?,
                ),
                "qwen2" => Weights::Qwen2(
                    quantized_qwen2::ModelWeights::from_gguf(content, &mut file, &device)
                        .context("failed to build qwen2 weights")?,
                ),
                other => bail!("unsupported GGUF architecture '{other}'"),
            };
            if matches!(weights, Weights::Llama(_)) {
                context_length = context_length.min(LLAMA_MAX_SEQ_LEN);
            }

            let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(anyhow::Error::msg)?;
            for marker in EOS_MARKERS {
                if let Some(id) = tokenizer.token_to_id(marker) {
                    if !eos_tokens.contains(&id) {
                        eos_tokens.push(id);
                    }
                }
            }

            Ok(Self {
                weights,
                tokenizer,
                device,
                eos_tokens,
                context_length,
            })
        }

        pub(super) fn generate(
            &mut self,
            request: &GenerationRequest,
            max_tokens: usize,
        ) -> Result<String> {
            let prompt = format!("{}{}", request.system_prompt, request.user_prompt);
            let encoding = self
                .tokenizer
                .encode(prompt, true)
                .map_err(anyhow::Error::msg)?;
            let prompt_tokens = encoding.get_ids();
            if prompt_tokens.is_empty() {
                bail!("prompt produced no tokens");
            }
            let Some(budget) =
                generation_budget(prompt_tokens.len(), max_tokens, self.context_length)
            else {
                bail!(
                    "prompt of {} tokens does not fit the {}-token context window",
                    prompt_tokens.len(),
                    self.context_length
                );
            };
            if budget < max_tokens {
                debug!(
                    budget,
                    max_tokens,
                    context_length = self.context_length,
                    "output capped by context window"
                );
            }

            let mut processor = LogitsProcessor::from_sampling(SEED, sampling(request));
            let mut generated = Vec::new();

            // Position 0 resets the KV cache left by any previous request.
            let input = Tensor::new(prompt_tokens, &self.device)?.unsqueeze(0)?;
            let mut logits = self.weights.forward(&input, 0)?;
            let mut position = prompt_tokens.len();

            for step in 0..budget {
                let values = logits.squeeze(0)?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
                let masked = min_p_mask(&values, request.min_p, request.temperature);
                let next = processor.sample(&Tensor::new(masked.as_slice(), &self.device)?)?;
                if self.eos_tokens.contains(&next) {
                    break;
                }
                generated.push(next);
                if step + 1 == budget {
                    break;
                }

                let input = Tensor::new(&[next], &self.device)?.unsqueeze(0)?;
                logits = self.weights.forward(&input, position)?;
                position += 1;
            }

            self.tokenizer
                .decode(&generated, true)
                .map_err(anyhow::Error::msg)
        }
    }

    fn sampling(request: &GenerationRequest) -> Sampling {
        let temperature = request.temperature;
        if temperature <= 0.0 {
            return Sampling::ArgMax;
        }
        let p = request.top_p;
        match usize::try_from(request.top_k) {
            Ok(k) if k > 0 && p > 0.0 && p < 1.0 => Sampling::TopKThenTopP { k, p, temperature },
            Ok(k) if k > 0 => Sampling::TopK { k, temperature },
            _ if p > 0.0 && p < 1.0 => Sampling::TopP { p, temperature },
            _ => Sampling::All { temperature },
        }
    }
}

#[cfg(not(feature = "candle"))]
mod runtime {
    use std::path::Path;

    use anyhow::{Result, bail};

    use crate::backend::GenerationRequest;

    pub(super) struct LoadedModel;

    impl LoadedModel {
        pub(super) fn load(_model_path: &Path, _tokenizer_path: &Path) -> Result<Self> {
            bail!("in-process models require the `candle` feature")
        }

        pub(super) fn generate(&mut self, _request: &GenerationRequest, _max_tokens: usize) -> Result<String> {
            bail!("in-process models require the `candle` feature")
        }
    }
}
