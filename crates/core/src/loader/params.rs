use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use super::CheckpointError;
use crate::distributed::ShardPolicy;

/// Value transform applied after sharding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostProcess {
    Copy,
    /// `-exp(x)`, turning a stored log-decay into the recurrence matrix.
    NegExp,
}

/// Declaration of one runtime parameter.
#[derive(Debug, Clone)]
pub struct ParameterSpec {
    pub name: String,
    /// Full (unsharded) shape expected from the checkpoint after translation.
    pub shape: Vec<usize>,
    pub policy: ShardPolicy,
    pub post: PostProcess,
    /// Storage dtype; `None` uses the set's dtype.
    pub dtype: Option<DType>,
    /// Whether this pipeline stage holds the parameter.
    pub owned: bool,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, shape: &[usize], policy: ShardPolicy) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
            policy,
            post: PostProcess::Copy,
            dtype: None,
            owned: true,
        }
    }

    pub fn with_post(mut self, post: PostProcess) -> Self {
        self.post = post;
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    pub fn owned(mut self, owned: bool) -> Self {
        self.owned = owned;
        self
    }
}

/// Declared runtime parameters of one worker and the values loaded so far.
///
/// Each owned parameter is hydrated exactly once; afterwards the set is
/// frozen into a `VarBuilder`.
pub struct ParameterSet {
    specs: BTreeMap<String, ParameterSpec>,
    values: HashMap<String, Tensor>,
    rank: usize,
    world_size: usize,
    dtype: DType,
    device: Device,
}

impl ParameterSet {
    /// `rank`/`world_size` describe the tensor-parallel group used to shard.
    pub fn new(rank: usize, world_size: usize, dtype: DType, device: &Device) -> Self {
        Self {
            specs: BTreeMap::new(),
            values: HashMap::new(),
            rank,
            world_size,
            dtype,
            device: device.clone(),
        }
    }

    pub fn declare(&mut self, spec: ParameterSpec) {
        self.specs.insert(spec.name.clone(), spec);
    }

    pub fn spec(&self, name: &str) -> Option<&ParameterSpec> {
        self.specs.get(name)
    }

    /// Every declared parameter, sorted by name.
    pub fn specs(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.specs.values()
    }

    pub fn is_hydrated(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn num_owned(&self) -> usize {
        self.specs.values().filter(|s| s.owned).count()
    }

    /// Owned parameters not yet hydrated, sorted by name.
    pub fn missing(&self) -> Vec<String> {
        self.specs
            .values()
            .filter(|s| s.owned && !self.values.contains_key(&s.name))
            .map(|s| s.name.clone())
            .collect()
    }

    /// Check, shard, post-process and store the full tensor for `name`.
    pub fn hydrate(&mut self, name: &str, full: &Tensor) -> Result<(), CheckpointError> {
        let spec = self
            .specs
            .get(name)
            .ok_or_else(|| CheckpointError::UnmappedTensor {
                checkpoint_name: name.to_string(),
                runtime_name: None,
            })?;
        if self.values.contains_key(name) {
            return Err(CheckpointError::AlreadyHydrated(name.to_string()));
        }
        if full.dims() != spec.shape.as_slice() {
            return Err(CheckpointError::ShapeMismatch {
                name: name.to_string(),
                expected: spec.shape.clone(),
                actual: full.dims().to_vec(),
            });
        }

        let shard = spec
            .policy
            .shard(full, self.rank, self.world_size)
            .map_err(|source| CheckpointError::Shard {
                name: name.to_string(),
                source,
            })?;
        let shard = match spec.post {
            PostProcess::Copy => shard,
            PostProcess::NegExp => shard.to_dtype(DType::F32)?.exp()?.neg()?,
        };
        let value = shard
            .to_dtype(spec.dtype.unwrap_or(self.dtype))?
            .to_device(&self.device)?;
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    /// Hydrated tensor for `name`.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.values.get(name)
    }

    /// Freeze into the map of local shards; fails if anything owned is missing.
    pub fn finish(self) -> Result<HashMap<String, Tensor>, CheckpointError> {
        let missing = self.missing();
        if !missing.is_empty() {
            return Err(CheckpointError::Unhydrated(missing));
        }
        Ok(self.values)
    }

    /// Freeze into a `VarBuilder` over the local shards.
    pub fn into_var_builder(self) -> Result<VarBuilder<'static>, CheckpointError> {
        let dtype = self.dtype;
        let device = self.device.clone();
        let values = self.finish()?;
        Ok(VarBuilder::from_tensors(values, dtype, &device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(rank: usize, world: usize) -> ParameterSet {
        ParameterSet::new(rank, world, DType::F32, &Device::Cpu)
    }

    #[test]
    fn hydrate_shards_and_post_processes() {
        let mut params = set(1, 2);
        params.declare(
            ParameterSpec::new("a", &[4, 2], ShardPolicy::Column).with_post(PostProcess::NegExp),
        );
        let full = Tensor::zeros((4, 2), DType::F32, &Device::Cpu).unwrap();
        params.hydrate("a", &full).unwrap();

        let a = params.get("a").unwrap();
        assert_eq!(a.dims(), &[2, 2]);
        let vals: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        assert!(vals.iter().all(|v| *v == -1.0));
    }

    #[test]
    fn dtype_override_is_kept() {
        let mut params = ParameterSet::new(0, 1, DType::BF16, &Device::Cpu);
        params.declare(ParameterSpec::new("d", &[3], ShardPolicy::Column).with_dtype(DType::F32));
        params.declare(ParameterSpec::new("w", &[3], ShardPolicy::Replicated));
        let full = Tensor::ones(3, DType::F32, &Device::Cpu).unwrap();
        params.hydrate("d", &full).unwrap();
        params.hydrate("w", &full).unwrap();
        assert_eq!(params.get("d").unwrap().dtype(), DType::F32);
        assert_eq!(params.get("w").unwrap().dtype(), DType::BF16);
    }

    #[test]
    fn hydration_errors() {
        let mut params = set(0, 1);
        params.declare(ParameterSpec::new("w", &[2, 2], ShardPolicy::Replicated));
        params.declare(ParameterSpec::new("other_stage", &[1], ShardPolicy::Replicated).owned(false));

        let wrong = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            params.hydrate("w", &wrong),
            Err(CheckpointError::ShapeMismatch { .. })
        ));

        let ok = Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap();
        params.hydrate("w", &ok).unwrap();
        assert!(matches!(
            params.hydrate("w", &ok),
            Err(CheckpointError::AlreadyHydrated(name)) if name == "w"
        ));
        assert!(params.missing().is_empty());
        assert_eq!(params.num_owned(), 1);
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn finish_reports_missing_owned_parameters() {
        let mut params = set(0, 1);
        params.declare(ParameterSpec::new("b", &[1], ShardPolicy::Replicated));
        params.declare(ParameterSpec::new("a", &[1], ShardPolicy::Replicated));
        match params.finish() {
            Err(CheckpointError::Unhydrated(names)) => assert_eq!(names, vec!["a", "b"]),
            other => panic!("expected Unhydrated, got {other:?}"),
        }
    }

    #[test]
    fn var_builder_serves_local_shards() {
        let mut params = set(0, 2);
        params.declare(ParameterSpec::new("layer.weight", &[4, 6], ShardPolicy::Row));
        let full = Tensor::ones((4, 6), DType::F32, &Device::Cpu).unwrap();
        params.hydrate("layer.weight", &full).unwrap();
        let vb = params.into_var_builder().unwrap();
        let w = vb.pp("layer").get((4, 3), "weight").unwrap();
        assert_eq!(w.dims(), &[4, 3]);
    }
}
