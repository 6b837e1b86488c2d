//! Process group abstractions for distributed inference.
//!
//! A process group is the set of workers that take part in one family of
//! collectives: the tensor-parallel group shares every large matrix, the
//! pipeline group passes the residual stream from stage to stage.

/// Configuration for parallel execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelConfig {
    /// Workers sharing each layer's matrices.
    pub tensor_parallel_size: usize,
    /// Contiguous layer ranges, one per stage.
    pub pipeline_parallel_size: usize,
}

impl ParallelConfig {
    /// Create a new parallel configuration.
    ///
    /// # Panics
    /// Panics if any size is 0.
    pub fn new(tensor_parallel_size: usize, pipeline_parallel_size: usize) -> Self {
        assert!(tensor_parallel_size > 0, "tensor_parallel_size must be > 0");
        assert!(
            pipeline_parallel_size > 0,
            "pipeline_parallel_size must be > 0"
        );
        Self {
            tensor_parallel_size,
            pipeline_parallel_size,
        }
    }

    pub fn no_parallelism() -> Self {
        Self::new(1, 1)
    }

    pub fn tensor_parallel(size: usize) -> Self {
        Self::new(size, 1)
    }

    pub fn pipeline_parallel(size: usize) -> Self {
        Self::new(1, size)
    }

    /// Total number of workers required.
    pub fn world_size(&self) -> usize {
        self.tensor_parallel_size * self.pipeline_parallel_size
    }

    pub fn is_single_gpu(&self) -> bool {
        self.world_size() == 1
    }
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self::no_parallelism()
    }
}

/// Trait for process group operations.
pub trait ProcessGroup: Send + Sync {
    /// Rank of this process within the group (0..world_size).
    fn rank(&self) -> usize;

    /// Total number of processes in the group.
    fn world_size(&self) -> usize;

    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    fn is_single(&self) -> bool {
        self.world_size() == 1
    }
}

/// In-process group description.
///
/// `new()` is the single-worker group; `with_rank` describes one member of a
/// larger group so sharding logic can be exercised without real peers.
#[derive(Debug, Clone)]
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
}

impl LocalProcessGroup {
    pub fn new() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// # Panics
    /// Panics if `rank >= world_size`.
    pub fn with_rank(rank: usize, world_size: usize) -> Self {
        assert!(rank < world_size, "rank must be < world_size");
        Self { rank, world_size }
    }
}

impl Default for LocalProcessGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }
}
