//! fastembed backend: ONNX Runtime inference over a user-defined model read
//! entirely from the local model directory. Nothing is downloaded.

use anyhow::{anyhow, Context, Result};
use fastembed::{
    InitOptionsUserDefined, Pooling, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel,
};
use std::path::Path;
use std::sync::Mutex;

use super::{TextEncoder, MODEL_FILE, TOKENIZER_FILE};

pub struct FastembedEncoder {
    // fastembed needs `&mut` to embed.
    model: Mutex<TextEmbedding>,
    dims: usize,
}

impl FastembedEncoder {
    pub fn load(dir: &Path, max_seq_len: usize) -> Result<Self> {
        let onnx_file = std::fs::read(dir.join(MODEL_FILE))
            .with_context(|| format!("Failed to read {}", dir.join(MODEL_FILE).display()))?;
        let tokenizer_file = std::fs::read(dir.join(TOKENIZER_FILE))
            .with_context(|| format!("Failed to read {}", dir.join(TOKENIZER_FILE).display()))?;

        // Exported sentence-transformers folders often ship only the tokenizer.
        let tokenizer_files = TokenizerFiles {
            tokenizer_file,
            config_file: read_or(
                dir,
                "config.json",
                serde_json::json!({ "pad_token_id": 0 }),
            )?,
            special_tokens_map_file: read_or(dir, "special_tokens_map.json", serde_json::json!({}))?,
            tokenizer_config_file: read_or(
                dir,
                "tokenizer_config.json",
                serde_json::json!({
                    "model_max_length": 512,
                    "pad_token": "[PAD]"
                }),
            )?,
        };

        let user_model =
            UserDefinedEmbeddingModel::new(onnx_file, tokenizer_files).with_pooling(Pooling::Mean);
        let options = InitOptionsUserDefined::new().with_max_length(max_seq_len);
        let mut model = TextEmbedding::try_new_from_user_defined(user_model, options)
            .map_err(|e| anyhow!("Failed to initialize embedding model: {}", e))?;

        let sample = model
            .embed(vec!["dimension check".to_string()], None)
            .map_err(|e| anyhow!("Embedding model test encode failed: {}", e))?;
        let dims = sample
            .first()
            .map(|v| v.len())
            .filter(|&d| d > 0)
            .ok_or_else(|| anyhow!("Embedding model produced an empty vector"))?;

        Ok(Self {
            model: Mutex::new(model),
            dims,
        })
    }
}

fn read_or(dir: &Path, name: &str, fallback: serde_json::Value) -> Result<Vec<u8>> {
    let path = dir.join(name);
    if path.is_file() {
        std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))
    } else {
        Ok(serde_json::to_vec(&fallback)?)
    }
}

impl TextEncoder for FastembedEncoder {
    fn dims(&self) -> usize {
        self.dims
    }

    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut model = self
            .model
            .lock()
            .map_err(|_| anyhow!("embedding model lock poisoned"))?;
        model
            .embed(texts.to_vec(), None)
            .map_err(|e| anyhow!("Local embedding failed: {}", e))
    }
}
