use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::safetensors::MmapedSafetensors;
use candle_core::Device;

use super::{finish_load, load_tensor, CheckpointError, CheckpointTranslator, LoadSummary, ParameterSet};

/// Memory-mapped safetensors shards of a published checkpoint.
pub struct SafetensorsCheckpoint {
    paths: Vec<PathBuf>,
    tensors: MmapedSafetensors,
}

impl SafetensorsCheckpoint {
    pub fn open(paths: &[PathBuf]) -> anyhow::Result<Self> {
        anyhow::ensure!(!paths.is_empty(), "no safetensors files given");
        // SAFETY: the files are treated as read-only for the lifetime of the mapping.
        let tensors = unsafe { MmapedSafetensors::multi(paths) }
            .with_context(|| format!("mapping {} safetensors file(s)", paths.len()))?;
        Ok(Self {
            paths: paths.to_vec(),
            tensors,
        })
    }

    /// Open `model.safetensors`, or every shard listed in
    /// `model.safetensors.index.json`.
    pub fn from_dir(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let paths = safetensor_paths(dir.as_ref())?;
        Self::open(&paths)
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Tensor names across all shards, sorted.
    pub fn tensor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tensors
            .tensors()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        names.sort();
        names
    }

    /// Stream every tensor through `translator` into `params`.
    ///
    /// Tensors are materialized one at a time on `device`.
    pub fn load_into(
        &self,
        params: &mut ParameterSet,
        translator: &CheckpointTranslator,
        device: &Device,
    ) -> Result<LoadSummary, CheckpointError> {
        let mut summary = LoadSummary::default();
        for name in self.tensor_names() {
            let tensor = self.tensors.load(&name, device)?;
            load_tensor(params, translator, &name, &tensor, &mut summary)?;
        }
        finish_load(params, summary)
    }
}

fn safetensor_paths(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let single = dir.join("model.safetensors");
    if single.is_file() {
        return Ok(vec![single]);
    }

    let index_path = dir.join("model.safetensors.index.json");
    let raw = std::fs::read_to_string(&index_path)
        .with_context(|| format!("reading {}", index_path.display()))?;
    let index: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", index_path.display()))?;
    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("missing weight_map in {}", index_path.display()))?;

    let mut filenames: Vec<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(String::from))
        .collect();
    filenames.sort_by_key(|a| natural_sort_key(a));
    filenames.dedup();
    Ok(filenames.into_iter().map(|f| dir.join(f)).collect())
}

/// Splits a file name into text and numeric runs so that
/// "model-2-of-10" sorts before "model-10-of-10".
fn natural_sort_key(s: &str) -> Vec<Result<u64, String>> {
    let basename = Path::new(s)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(s);
    let mut parts = Vec::new();
    let mut run = String::new();
    let mut digits = false;
    for c in basename.chars() {
        if !run.is_empty() && c.is_ascii_digit() != digits {
            parts.push(close_run(&mut run, digits));
        }
        digits = c.is_ascii_digit();
        run.push(c);
    }
    if !run.is_empty() {
        parts.push(close_run(&mut run, digits));
    }
    parts
}

fn close_run(run: &mut String, digits: bool) -> Result<u64, String> {
    let text = std::mem::take(run);
    if digits {
        Ok(text.parse().unwrap_or(u64::MAX))
    } else {
        Err(text)
    }
}
