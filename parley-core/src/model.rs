//! Candle-backed model loading and execution
//!
//! Implements [`ModelBackend`] over candle-transformers' LLaMA-family
//! models: weights come from a local directory or the HuggingFace Hub as
//! safetensors, text⇄ids go through `tokenizers`. The engine never sees any
//! of this directly; it talks to the trait.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig, LlamaEosToks};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer as HfTokenizer;
use tracing::info;

use crate::backend::{DecodeBatch, ModelBackend};
use crate::engine::EngineConfig;
use crate::error::{EngineError, Result};

/// Model files needed to bring a backend up.
struct ModelFiles {
    tokenizer: PathBuf,
    config: PathBuf,
    weights: Vec<PathBuf>,
}

/// [`ModelBackend`] implementation over a candle LLaMA model.
///
/// `mirror` tracks the tokens logically present in the attention state.
/// candle's `Cache` cannot evict a position range, so `kv_drop` truncates
/// the mirror and marks the cache dirty; the next decode rebuilds the cache
/// and replays the retained prefix in the same forward pass.
pub struct CandleBackend {
    model: Llama,
    cache: Cache,
    model_config: Config,
    tokenizer: HfTokenizer,
    device: Device,
    dtype: DType,
    n_ctx: usize,
    bos: Option<u32>,
    eos: Option<u32>,
    pad: Option<u32>,
    mirror: Vec<u32>,
    dirty: bool,
    last_logits: Option<(usize, Vec<f32>)>,
}

impl CandleBackend {
    /// Load weights, tokenizer and config per `config.model_path` (local
    /// directory or HuggingFace model id).
    pub fn load(config: &EngineConfig) -> Result<Self> {
        info!(model = %config.model_path, "loading model");

        let files = resolve_files(&config.model_path)?;
        let device = select_device(config.n_gpu_layers);
        let dtype = if device.is_cuda() || device.is_metal() {
            DType::F16
        } else {
            DType::F32
        };

        let tokenizer = HfTokenizer::from_file(&files.tokenizer)
            .map_err(|e| EngineError::Init(format!("failed to load tokenizer: {e}")))?;

        let raw_config = std::fs::read(&files.config)
            .map_err(|e| EngineError::Init(format!("failed to read model config: {e}")))?;
        let llama_config: LlamaConfig = serde_json::from_slice(&raw_config)
            .map_err(|e| EngineError::Init(format!("failed to parse model config: {e}")))?;
        let model_config = llama_config.into_config(false);

        let vb = if config.use_mmap {
            unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device) }
                .map_err(|e| EngineError::Init(format!("failed to map weights: {e}")))?
        } else {
            let mut tensors = HashMap::new();
            for file in &files.weights {
                let loaded = candle_core::safetensors::load(file, &device)
                    .map_err(|e| EngineError::Init(format!("failed to read weights: {e}")))?;
                tensors.extend(loaded);
            }
            VarBuilder::from_tensors(tensors, dtype, &device)
        };

        let model = Llama::load(vb, &model_config)
            .map_err(|e| EngineError::Init(format!("failed to build model: {e}")))?;
        let cache = Cache::new(true, dtype, &model_config, &device)
            .map_err(|e| EngineError::Init(format!("failed to allocate cache: {e}")))?;

        let eos = match &model_config.eos_token_id {
            Some(LlamaEosToks::Single(id)) => Some(*id),
            Some(LlamaEosToks::Multiple(ids)) => ids.first().copied(),
            None => tokenizer.token_to_id("</s>"),
        };
        let bos = model_config
            .bos_token_id
            .or_else(|| tokenizer.token_to_id("<s>"));
        let pad = tokenizer
            .token_to_id("<pad>")
            .or_else(|| tokenizer.token_to_id("<|pad|>"));

        info!(
            vocab = model_config.vocab_size,
            hidden = model_config.hidden_size,
            layers = model_config.num_hidden_layers,
            ?device,
            "model loaded"
        );

        Ok(Self {
            model,
            cache,
            model_config,
            tokenizer,
            device,
            dtype,
            n_ctx: config.n_ctx,
            bos,
            eos,
            pad,
            mirror: Vec::new(),
            dirty: false,
            last_logits: None,
        })
    }
}

impl ModelBackend for CandleBackend {
    fn vocab_size(&self) -> usize {
        self.model_config.vocab_size
    }

    fn embed_dim(&self) -> usize {
        self.model_config.hidden_size
    }

    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn bos_id(&self) -> Option<u32> {
        self.bos
    }

    fn eos_id(&self) -> Option<u32> {
        self.eos
    }

    fn pad_id(&self) -> Option<u32> {
        self.pad
    }

    fn token_to_id(&self, text: &str) -> Option<u32> {
        self.tokenizer.token_to_id(text)
    }

    fn token_to_piece(&self, id: u32, render_special: bool) -> String {
        self.tokenizer.decode(&[id], !render_special).unwrap_or_default()
    }

    fn tokenize(&self, text: &str, add_bos: bool, allow_special: bool) -> Result<Vec<u32>> {
        // Added tokens always map to their single id; breaking the marker
        // pattern with a zero-width space forces a literal reading.
        let text = if allow_special {
            text.to_string()
        } else {
            text.replace("<|", "<\u{200B}|")
        };
        let encoding = self
            .tokenizer
            .encode(text, add_bos)
            .map_err(|e| EngineError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&mut self, batch: &DecodeBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let expected = self.mirror.len();
        if batch.positions.first() != Some(&expected) {
            return Err(EngineError::Decode(format!(
                "batch starts at position {:?}, cache holds {expected} tokens",
                batch.positions.first()
            )));
        }

        let (input_tokens, index_pos) = if self.dirty {
            self.cache = Cache::new(true, self.dtype, &self.model_config, &self.device)
                .map_err(|e| EngineError::Decode(e.to_string()))?;
            self.dirty = false;
            let mut replay = self.mirror.clone();
            replay.extend_from_slice(&batch.tokens);
            (replay, 0)
        } else {
            (batch.tokens.clone(), expected)
        };

        let input = Tensor::new(input_tokens.as_slice(), &self.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(|e| EngineError::Decode(e.to_string()))?;
        let logits = self
            .model
            .forward(&input, index_pos, &mut self.cache)
            .map_err(|e| EngineError::Decode(e.to_string()))?;

        self.mirror.extend_from_slice(&batch.tokens);

        if batch.logits_mask.iter().any(|&m| m) {
            let row: Vec<f32> = logits
                .squeeze(0)
                .and_then(|t| t.to_vec1())
                .map_err(|e| EngineError::Decode(e.to_string()))?;
            self.last_logits = Some((self.mirror.len() - 1, row));
        }

        Ok(())
    }

    fn logits_at(&self, pos: usize) -> Result<Vec<f32>> {
        match &self.last_logits {
            Some((p, row)) if *p == pos => Ok(row.clone()),
            _ => Err(EngineError::Decode(format!(
                "no logits retained for position {pos}"
            ))),
        }
    }

    fn kv_drop(&mut self, start: usize, _end: usize) {
        self.mirror.truncate(start);
        self.dirty = true;
        self.last_logits = None;
    }

    fn kv_clear(&mut self) {
        self.mirror.clear();
        self.dirty = true;
        self.last_logits = None;
    }
}

/// Pick the compute device. A nonzero layer count requests the accelerator
/// when the matching cargo feature is enabled; CPU otherwise.
fn select_device(n_gpu_layers: i32) -> Device {
    #[cfg(feature = "cuda")]
    if n_gpu_layers != 0 {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }
    #[cfg(feature = "metal")]
    if n_gpu_layers != 0 {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }
    let _ = n_gpu_layers;
    Device::Cpu
}

fn resolve_files(model_path: &str) -> Result<ModelFiles> {
    let local = Path::new(model_path);
    if local.is_dir() {
        return Ok(ModelFiles {
            tokenizer: local.join("tokenizer.json"),
            config: local.join("config.json"),
            weights: local_weights(local)?,
        });
    }

    let api = Api::new().map_err(|e| EngineError::Init(e.to_string()))?;
    let repo = api.repo(Repo::with_revision(
        model_path.to_string(),
        RepoType::Model,
        "main".to_string(),
    ));

    let tokenizer = repo
        .get("tokenizer.json")
        .map_err(|e| EngineError::Init(format!("tokenizer.json: {e}")))?;
    let config = repo
        .get("config.json")
        .map_err(|e| EngineError::Init(format!("config.json: {e}")))?;

    // Sharded models carry an index mapping tensors to shard files.
    let weights = match repo.get("model.safetensors.index.json") {
        Ok(index) => {
            let shards = sharded_weight_names(&index)?;
            let mut files = Vec::with_capacity(shards.len());
            for shard in shards {
                files.push(
                    repo.get(&shard)
                        .map_err(|e| EngineError::Init(format!("{shard}: {e}")))?,
                );
            }
            files
        }
        Err(_) => vec![repo
            .get("model.safetensors")
            .map_err(|e| EngineError::Init(format!("model.safetensors: {e}")))?],
    };

    Ok(ModelFiles {
        tokenizer,
        config,
        weights,
    })
}

fn local_weights(dir: &Path) -> Result<Vec<PathBuf>> {
    let index = dir.join("model.safetensors.index.json");
    if index.is_file() {
        let shards = sharded_weight_names(&index)?;
        return Ok(shards.into_iter().map(|s| dir.join(s)).collect());
    }

    let single = dir.join("model.safetensors");
    if single.is_file() {
        return Ok(vec![single]);
    }
    Err(EngineError::Init(format!(
        "no model.safetensors under {}",
        dir.display()
    )))
}

fn sharded_weight_names(index_path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read(index_path).map_err(|e| EngineError::Init(e.to_string()))?;
    let json: serde_json::Value =
        serde_json::from_slice(&raw).map_err(|e| EngineError::Init(e.to_string()))?;
    let weight_map = json
        .get("weight_map")
        .and_then(|v| v.as_object())
        .ok_or_else(|| EngineError::Init(format!("no weight map in {}", index_path.display())))?;

    let mut files: Vec<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    files.sort_unstable();
    files.dedup();
    Ok(files)
}
