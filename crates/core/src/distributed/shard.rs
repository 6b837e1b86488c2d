//! How a full (unsharded) checkpoint tensor maps onto one worker's shard.
//!
//! Checkpoints store every matrix whole. Each runtime parameter declares a
//! [`ShardPolicy`]; at load time the policy cuts out the rows/columns this
//! rank owns so that the parallel layers receive ready-to-use shards.

use candle_core::Tensor;

use super::error::{DistributedError, Result};

/// Tokens of the vocabulary are padded to a multiple of this per rank.
pub const VOCAB_PADDING: usize = 16;

/// Vocabulary size rounded up so that every rank owns the same number of
/// rows, each shard a multiple of [`VOCAB_PADDING`].
pub fn padded_vocab_size(vocab_size: usize, world_size: usize) -> usize {
    let multiple = VOCAB_PADDING * world_size;
    vocab_size.div_ceil(multiple) * multiple
}

/// First KV head and number of KV heads held by `rank`.
///
/// When there are fewer KV heads than ranks, each head is replicated on
/// `world_size / num_kv_heads` consecutive ranks.
pub fn kv_head_partition(num_kv_heads: usize, rank: usize, world_size: usize) -> (usize, usize) {
    if num_kv_heads >= world_size {
        let per_rank = num_kv_heads / world_size;
        (rank * per_rank, per_rank)
    } else {
        let replicas = world_size / num_kv_heads;
        (rank / replicas, 1)
    }
}

/// Partitioning rule for one runtime parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardPolicy {
    /// Every rank holds the full tensor.
    Replicated,
    /// Dim 0 split evenly (output features of a column-parallel linear).
    Column,
    /// Dim 1 split evenly (input features of a row-parallel linear).
    Row,
    /// Dim 0 is a stack of sub-matrices of the given row counts; each one is
    /// split independently and the local pieces re-stacked.
    MergedColumn(Vec<usize>),
    /// Fused query/key/value rows: query heads split evenly, KV heads split
    /// or replicated.
    Qkv {
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
    },
    /// Dim 0 indexed by KV head, split or replicated like the KV projection.
    KvHeads { num_kv_heads: usize },
    /// Vocabulary rows, padded with zeros up to `padded_vocab_size`.
    Vocab {
        vocab_size: usize,
        padded_vocab_size: usize,
    },
}

fn even_split(size: usize, world_size: usize) -> Result<usize> {
    if world_size == 0 || size % world_size != 0 {
        return Err(DistributedError::Indivisible { size, world_size });
    }
    Ok(size / world_size)
}

fn leading_dim(shape: &[usize]) -> Result<usize> {
    shape.first().copied().ok_or(DistributedError::ShapeMismatch {
        expected: vec![1],
        actual: vec![],
    })
}

impl ShardPolicy {
    /// Shape of the local shard for a parameter whose full shape is `full`.
    pub fn local_shape(&self, full: &[usize], rank: usize, world_size: usize) -> Result<Vec<usize>> {
        let mut shape = full.to_vec();
        match self {
            ShardPolicy::Replicated => {}
            ShardPolicy::Column => shape[0] = even_split(leading_dim(full)?, world_size)?,
            ShardPolicy::Row => {
                if full.len() < 2 {
                    return Err(DistributedError::ShapeMismatch {
                        expected: vec![0, 0],
                        actual: full.to_vec(),
                    });
                }
                shape[1] = even_split(full[1], world_size)?;
            }
            ShardPolicy::MergedColumn(sizes) => {
                let mut rows = 0;
                for &size in sizes {
                    rows += even_split(size, world_size)?;
                }
                shape[0] = rows;
            }
            ShardPolicy::Qkv {
                num_heads,
                num_kv_heads,
                head_dim,
            } => {
                let q_heads = even_split(*num_heads, world_size)?;
                let (_, kv_heads) = kv_head_partition(*num_kv_heads, rank, world_size);
                shape[0] = (q_heads + 2 * kv_heads) * head_dim;
            }
            ShardPolicy::KvHeads { num_kv_heads } => {
                let rows_per_head = leading_dim(full)? / num_kv_heads;
                let (_, kv_heads) = kv_head_partition(*num_kv_heads, rank, world_size);
                shape[0] = kv_heads * rows_per_head;
            }
            ShardPolicy::Vocab {
                padded_vocab_size, ..
            } => shape[0] = even_split(*padded_vocab_size, world_size)?,
        }
        Ok(shape)
    }

    /// Cut the local shard out of the full tensor.
    pub fn shard(&self, full: &Tensor, rank: usize, world_size: usize) -> Result<Tensor> {
        if rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }
        let shard = match self {
            ShardPolicy::Replicated => return Ok(full.clone()),
            ShardPolicy::Column => {
                let rows = even_split(full.dim(0)?, world_size)?;
                full.narrow(0, rank * rows, rows)?
            }
            ShardPolicy::Row => {
                let cols = even_split(full.dim(1)?, world_size)?;
                full.narrow(1, rank * cols, cols)?
            }
            ShardPolicy::MergedColumn(sizes) => {
                let total: usize = sizes.iter().sum();
                if total != full.dim(0)? {
                    return Err(DistributedError::ShapeMismatch {
                        expected: vec![total],
                        actual: full.dims().to_vec(),
                    });
                }
                let mut pieces = Vec::with_capacity(sizes.len());
                let mut offset = 0;
                for &size in sizes {
                    let rows = even_split(size, world_size)?;
                    pieces.push(full.narrow(0, offset + rank * rows, rows)?);
                    offset += size;
                }
                Tensor::cat(&pieces, 0)?
            }
            ShardPolicy::Qkv {
                num_heads,
                num_kv_heads,
                head_dim,
            } => {
                let q_size = num_heads * head_dim;
                let kv_size = num_kv_heads * head_dim;
                if full.dim(0)? != q_size + 2 * kv_size {
                    return Err(DistributedError::ShapeMismatch {
                        expected: vec![q_size + 2 * kv_size],
                        actual: full.dims().to_vec(),
                    });
                }
                let q_rows = even_split(q_size, world_size)?;
                let (kv_start, kv_heads) = kv_head_partition(*num_kv_heads, rank, world_size);
                let q = full.narrow(0, rank * q_rows, q_rows)?;
                let k = full.narrow(0, q_size + kv_start * head_dim, kv_heads * head_dim)?;
                let v = full.narrow(
                    0,
                    q_size + kv_size + kv_start * head_dim,
                    kv_heads * head_dim,
                )?;
                Tensor::cat(&[q, k, v], 0)?
            }
            ShardPolicy::KvHeads { num_kv_heads } => {
                let rows_per_head = full.dim(0)? / num_kv_heads;
                let (kv_start, kv_heads) = kv_head_partition(*num_kv_heads, rank, world_size);
                full.narrow(0, kv_start * rows_per_head, kv_heads * rows_per_head)?
            }
            ShardPolicy::Vocab {
                vocab_size,
                padded_vocab_size,
            } => {
                let per_rank = even_split(*padded_vocab_size, world_size)?;
                let start = rank * per_rank;
                let real = vocab_size.saturating_sub(start).min(per_rank);
                let mut pieces = Vec::with_capacity(2);
                if real > 0 {
                    pieces.push(full.narrow(0, start, real)?);
                }
                if real < per_rank {
                    let mut pad_shape = full.dims().to_vec();
                    pad_shape[0] = per_rank - real;
                    pieces.push(Tensor::zeros(pad_shape, full.dtype(), full.device())?);
                }
                Tensor::cat(&pieces, 0)?
            }
        };
        Ok(shard.contiguous()?)
    }
}
