//! Tract-based embedding backend (fallback for musl and Intel Mac).
//!
//! Pure-Rust path: loads the ONNX graph with tract-onnx and tokenizes with
//! the tokenizers crate. Runs on the blocking pool via the engine.
#![cfg_attr(
    all(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract"),
    allow(dead_code)
)]

use anyhow::{anyhow, bail, Result};
use std::path::Path;
use tract_onnx::prelude::*;

use super::{TextEncoder, MODEL_FILE, TOKENIZER_FILE};

pub struct TractEncoder {
    model: TypedRunnableModel<TypedModel>,
    tokenizer: tokenizers::Tokenizer,
    /// BERT exports take `token_type_ids` as a third input; some exports drop it.
    has_type_ids: bool,
    max_seq_len: usize,
    dims: usize,
}

impl TractEncoder {
    pub fn load(dir: &Path, max_seq_len: usize) -> Result<Self> {
        let tokenizer = tokenizers::Tokenizer::from_file(dir.join(TOKENIZER_FILE))
            .map_err(|e| anyhow!("Load tokenizer: {}", e))?;

        let model = tract_onnx::onnx()
            .model_for_path(dir.join(MODEL_FILE))
            .map_err(|e| anyhow!("Load ONNX: {}", e))?
            .into_optimized()
            .map_err(|e| anyhow!("Optimize: {}", e))?
            .into_runnable()
            .map_err(|e| anyhow!("Build tract runnable: {}", e))?;

        let has_type_ids = model.model().inputs.len() >= 3;

        let mut encoder = Self {
            model,
            tokenizer,
            has_type_ids,
            max_seq_len: max_seq_len.max(2),
            dims: 0,
        };
        let sample = encoder.run(&["dimension check".to_string()])?;
        encoder.dims = sample
            .first()
            .map(|v| v.len())
            .filter(|&d| d > 0)
            .ok_or_else(|| anyhow!("Embedding model produced an empty vector"))?;
        Ok(encoder)
    }

    fn run(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let encodings: Vec<_> = texts
            .iter()
            .map(|s| {
                self.tokenizer
                    .encode(s.as_str(), true)
                    .map_err(|e| anyhow!("Tokenize: {}", e))
            })
            .collect::<Result<Vec<_>>>()?;

        let seq_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(1)
            .clamp(1, self.max_seq_len);

        let batch = encodings.len();
        let mut input_ids = vec![0i64; batch * seq_len];
        let mut attention_mask = vec![0i64; batch * seq_len];
        let mut type_ids = vec![0i64; batch * seq_len];

        for (i, enc) in encodings.iter().enumerate() {
            let ids = enc.get_ids();
            let types = enc.get_type_ids();
            for j in 0..ids.len().min(seq_len) {
                input_ids[i * seq_len + j] = ids[j] as i64;
                attention_mask[i * seq_len + j] = 1;
                type_ids[i * seq_len + j] = types.get(j).copied().unwrap_or(0) as i64;
            }
        }

        let shape = (batch, seq_len);
        let mut inputs: TVec<TValue> = tvec!(
            Tensor::from(ndarray::Array2::from_shape_vec(shape, input_ids)?).into(),
            Tensor::from(ndarray::Array2::from_shape_vec(shape, attention_mask.clone())?).into(),
        );
        if self.has_type_ids {
            inputs.push(Tensor::from(ndarray::Array2::from_shape_vec(shape, type_ids)?).into());
        }

        let result = self.model.run(inputs)?;
        let output = result
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No output tensor"))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| anyhow!("Output to array: {}", e))?;

        // Either a pooled [batch, dims] sentence embedding or a
        // [batch, seq_len, dims] last_hidden_state to mean-pool.
        let out_shape = view.shape().to_vec();
        let mut vectors = Vec::with_capacity(batch);
        match out_shape.len() {
            2 => {
                for i in 0..out_shape[0] {
                    vectors.push(view.slice(ndarray::s![i, ..]).iter().copied().collect());
                }
            }
            3 => {
                let dims = out_shape[2];
                for i in 0..batch {
                    let mut sum = vec![0f32; dims];
                    let mut count = 0f32;
                    for j in 0..out_shape[1].min(seq_len) {
                        if attention_mask[i * seq_len + j] == 0 {
                            continue;
                        }
                        for (k, &v) in view.slice(ndarray::s![i, j, ..]).iter().enumerate() {
                            sum[k] += v;
                        }
                        count += 1.0;
                    }
                    if count > 0.0 {
                        for x in &mut sum {
                            *x /= count;
                        }
                    }
                    vectors.push(sum);
                }
            }
            _ => bail!("Unexpected output shape: {:?}", out_shape),
        }

        Ok(vectors)
    }
}

impl TextEncoder for TractEncoder {
    fn dims(&self) -> usize {
        self.dims
    }

    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.run(texts)
    }
}
