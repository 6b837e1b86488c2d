//! Parallel linear layers for tensor parallelism.
//!
//! Weights arrive already sharded: the checkpoint loader cuts each full
//! tensor with its [`ShardPolicy`](super::ShardPolicy) before the layer is
//! built, so every constructor here reads the *local* shape.
//!
//! # Column Parallel Linear
//! Splits the output dimension: each worker computes a slice of the output.
//! Used for: merged input projections, QKV projection, gate/up in the MLP.
//!
//! # Row Parallel Linear
//! Splits the input dimension: each worker produces a partial sum that is
//! all-reduced. Used for: output projections, down projection in the MLP.
//!
//! Both implement [`Module`], so callers apply the distributed affine map
//! without knowing how many workers take part.

use std::sync::Arc;

use candle_core::{DType, Module, Result, Tensor};
use candle_nn::VarBuilder;

use super::communicator::{DeviceCommunicator, ReduceOp};

fn matmul_last_dim(input: &Tensor, weight: &Tensor) -> Result<Tensor> {
    let input_dims = input.dims();
    let in_features = *input_dims
        .last()
        .ok_or_else(|| candle_core::Error::Msg("tensor must have at least 1 dimension".into()))?;
    let batch_size: usize = input_dims.iter().rev().skip(1).product();
    let flat_input = input.reshape((batch_size, in_features))?;
    flat_input.matmul(&weight.t()?)
}

fn restore_leading_dims(output: Tensor, input: &Tensor) -> Result<Tensor> {
    let out_features = output.dim(1)?;
    let input_dims = input.dims();
    let mut out_shape: Vec<usize> = input_dims[..input_dims.len() - 1].to_vec();
    out_shape.push(out_features);
    output.reshape(out_shape.as_slice())
}

/// Column-parallel linear layer.
///
/// `output_chunk = input @ weight_chunkᵀ + bias_chunk`, optionally
/// all-gathered along the feature dimension.
pub struct ColumnParallelLinear {
    /// Weight: [out_features / tp, in_features]
    weight: Tensor,
    /// Optional bias: [out_features / tp]
    bias: Option<Tensor>,
    gather_output: bool,
    comm: Arc<dyn DeviceCommunicator>,
}

impl ColumnParallelLinear {
    /// Load the local shard `[out_local, in_features]` from `vb`.
    pub fn load(
        in_features: usize,
        out_local: usize,
        bias: bool,
        gather_output: bool,
        vb: VarBuilder,
        comm: Arc<dyn DeviceCommunicator>,
    ) -> Result<Self> {
        let weight = vb.get((out_local, in_features), "weight")?;
        let bias = if bias {
            Some(vb.get(out_local, "bias")?)
        } else {
            None
        };
        Ok(Self::from_parts(weight, bias, gather_output, comm))
    }

    pub fn from_parts(
        weight: Tensor,
        bias: Option<Tensor>,
        gather_output: bool,
        comm: Arc<dyn DeviceCommunicator>,
    ) -> Self {
        Self {
            weight,
            bias,
            gather_output,
            comm,
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
}

impl Module for ColumnParallelLinear {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut output = matmul_last_dim(input, &self.weight)?;
        if let Some(ref bias) = self.bias {
            output = output.broadcast_add(bias)?;
        }
        if self.gather_output && !self.comm.process_group().is_single() {
            output = self.comm.all_gather(&output, 1)?;
        }
        restore_leading_dims(output, input)
    }
}

/// Row-parallel linear layer.
///
/// `output = all_reduce(input_chunk @ weight_chunkᵀ) + bias`.
pub struct RowParallelLinear {
    /// Weight: [out_features, in_features / tp]
    weight: Tensor,
    /// Bias is added once, after the reduction.
    bias: Option<Tensor>,
    comm: Arc<dyn DeviceCommunicator>,
}

impl RowParallelLinear {
    /// Load the local shard `[out_features, in_local]` from `vb`.
    pub fn load(
        in_local: usize,
        out_features: usize,
        bias: bool,
        vb: VarBuilder,
        comm: Arc<dyn DeviceCommunicator>,
    ) -> Result<Self> {
        let weight = vb.get((out_features, in_local), "weight")?;
        let bias = if bias {
            Some(vb.get(out_features, "bias")?)
        } else {
            None
        };
        Ok(Self::from_parts(weight, bias, comm))
    }

    pub fn from_parts(
        weight: Tensor,
        bias: Option<Tensor>,
        comm: Arc<dyn DeviceCommunicator>,
    ) -> Self {
        Self { weight, bias, comm }
    }
}

impl Module for RowParallelLinear {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let output = matmul_last_dim(input, &self.weight)?;
        let mut output = if self.comm.process_group().is_single() {
            output
        } else {
            self.comm.all_reduce(&output, ReduceOp::Sum)?
        };
        if let Some(ref bias) = self.bias {
            output = output.broadcast_add(bias)?;
        }
        restore_leading_dims(output, input)
    }
}

/// Vocabulary-parallel embedding.
///
/// Each worker holds `padded_vocab / tp` rows; tokens outside the local
/// range contribute zeros and the partial lookups are summed with an
/// all-reduce.
pub struct VocabParallelEmbedding {
    /// Embedding table shard: [padded_vocab / tp, hidden]
    embeddings: Tensor,
    vocab_start: usize,
    comm: Arc<dyn DeviceCommunicator>,
}

impl VocabParallelEmbedding {
    pub fn load(
        rows_per_rank: usize,
        hidden_size: usize,
        vb: VarBuilder,
        comm: Arc<dyn DeviceCommunicator>,
    ) -> Result<Self> {
        let embeddings = vb.get((rows_per_rank, hidden_size), "weight")?;
        Ok(Self::from_parts(embeddings, comm))
    }

    pub fn from_parts(embeddings: Tensor, comm: Arc<dyn DeviceCommunicator>) -> Self {
        let rows = embeddings.dims().first().copied().unwrap_or(0);
        let vocab_start = comm.process_group().rank() * rows;
        Self {
            embeddings,
            vocab_start,
            comm,
        }
    }

    /// Local table shard, shared with a tied LM head.
    pub fn embeddings(&self) -> &Tensor {
        &self.embeddings
    }
}

impl Module for VocabParallelEmbedding {
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let hidden_size = self.embeddings.dim(1)?;
        let input_shape = input_ids.dims().to_vec();
        let flat_input = input_ids.flatten_all()?;
        let mut out_shape = input_shape;
        out_shape.push(hidden_size);

        if self.comm.process_group().is_single() {
            let output = self.embeddings.embedding(&flat_input)?;
            return output.reshape(out_shape.as_slice());
        }

        let device = self.embeddings.device();
        let rows = self.embeddings.dim(0)?;
        let input_i64 = flat_input.to_dtype(DType::I64)?;
        let start = Tensor::new(&[self.vocab_start as i64], device)?.broadcast_as(input_i64.shape())?;
        let end = Tensor::new(&[(self.vocab_start + rows) as i64], device)?
            .broadcast_as(input_i64.shape())?;

        // mask = (id >= start) & (id < end)
        let mask = input_i64.ge(&start)?.mul(&input_i64.lt(&end)?)?;
        let local = (input_i64 - start)?
            .clamp(0i64, rows.saturating_sub(1) as i64)?
            .to_dtype(DType::U32)?;
        let embedded = self.embeddings.embedding(&local)?;
        let mask = mask.to_dtype(self.embeddings.dtype())?.unsqueeze(1)?;
        let embedded = embedded.broadcast_mul(&mask)?;
        let output = self.comm.all_reduce(&embedded, ReduceOp::Sum)?;
        output.reshape(out_shape.as_slice())
    }
}

/// Output head producing per-vocabulary scores.
///
/// Works on the padded vocabulary shard, gathers the shards and trims the
/// padding so callers always see `vocab_size` columns.
pub struct ParallelLmHead {
    proj: ColumnParallelLinear,
    vocab_size: usize,
}

impl ParallelLmHead {
    pub fn new(weight: Tensor, vocab_size: usize, comm: Arc<dyn DeviceCommunicator>) -> Self {
        Self {
            proj: ColumnParallelLinear::from_parts(weight, None, true, comm),
            vocab_size,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}

impl Module for ParallelLmHead {
    fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let logits = self.proj.forward(hidden)?;
        logits.narrow(candle_core::D::Minus1, 0, self.vocab_size)
    }
}
