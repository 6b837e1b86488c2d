//! Recurrent state cache for the Mamba layers of a hybrid stack.
//!
//! Instead of a KV cache, every recurrent layer keeps two fixed-size rows per
//! sequence slot:
//!
//! - **conv row**: the last `d_conv - 1` pre-convolution inputs (`[d_inner, d_conv - 1]`)
//! - **SSM row**: the recurrence state `h` (`[d_inner, d_state]`)
//!
//! Rows live in an arena indexed by slot. Rows are replaced on write, never
//! mutated in place, so a gathered batch stays valid while the mixer runs.

use std::collections::HashMap;

use candle_core::{DType, Device, Result, Tensor};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateCacheError {
    #[error("all {0} state slots are in use")]
    NoFreeSlots(usize),
    #[error("request {0} already has a state slot")]
    RequestAlreadyExists(u64),
    #[error("request {0} has no state slot")]
    RequestNotFound(u64),
    #[error("slot {slot} out of range for {num_slots} slots")]
    SlotOutOfRange { slot: usize, num_slots: usize },
    #[error("candle error: {0}")]
    Tensor(#[from] candle_core::Error),
}

/// Conv and SSM rows of one recurrent layer, one of each per slot.
#[derive(Debug, Clone)]
pub struct MambaLayerState {
    conv_rows: Vec<Tensor>,
    ssm_rows: Vec<Tensor>,
}

impl MambaLayerState {
    fn zeroed(num_slots: usize, conv_zero: &Tensor, ssm_zero: &Tensor) -> Self {
        Self {
            conv_rows: vec![conv_zero.clone(); num_slots],
            ssm_rows: vec![ssm_zero.clone(); num_slots],
        }
    }

    pub fn num_slots(&self) -> usize {
        self.conv_rows.len()
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.num_slots() {
            candle_core::bail!(
                "state slot {slot} out of range for {} slots",
                self.num_slots()
            );
        }
        Ok(())
    }

    /// Conv row of `slot`, `[d_inner, d_conv - 1]`.
    pub fn conv_row(&self, slot: usize) -> Result<&Tensor> {
        self.check_slot(slot)?;
        Ok(&self.conv_rows[slot])
    }

    /// SSM row of `slot`, `[d_inner, d_state]`.
    pub fn ssm_row(&self, slot: usize) -> Result<&Tensor> {
        self.check_slot(slot)?;
        Ok(&self.ssm_rows[slot])
    }

    pub fn set_conv_row(&mut self, slot: usize, row: Tensor) -> Result<()> {
        self.check_slot(slot)?;
        let current = &self.conv_rows[slot];
        if row.dims() != current.dims() {
            candle_core::bail!(
                "conv row for slot {slot} has shape {:?}, expected {:?}",
                row.dims(),
                current.dims()
            );
        }
        self.conv_rows[slot] = row.to_dtype(current.dtype())?;
        Ok(())
    }

    pub fn set_ssm_row(&mut self, slot: usize, row: Tensor) -> Result<()> {
        self.check_slot(slot)?;
        let current = &self.ssm_rows[slot];
        if row.dims() != current.dims() {
            candle_core::bail!(
                "SSM row for slot {slot} has shape {:?}, expected {:?}",
                row.dims(),
                current.dims()
            );
        }
        self.ssm_rows[slot] = row.to_dtype(current.dtype())?;
        Ok(())
    }

    /// Stack the conv rows of `slots` into `[slots, d_inner, d_conv - 1]`.
    pub fn gather_conv(&self, slots: &[usize]) -> Result<Tensor> {
        let rows = slots
            .iter()
            .map(|&s| self.conv_row(s))
            .collect::<Result<Vec<_>>>()?;
        Tensor::stack(&rows, 0)
    }

    /// Stack the SSM rows of `slots` into `[slots, d_inner, d_state]`.
    pub fn gather_ssm(&self, slots: &[usize]) -> Result<Tensor> {
        let rows = slots
            .iter()
            .map(|&s| self.ssm_row(s))
            .collect::<Result<Vec<_>>>()?;
        Tensor::stack(&rows, 0)
    }

    /// Inverse of [`gather_conv`](Self::gather_conv).
    pub fn scatter_conv(&mut self, slots: &[usize], rows: &Tensor) -> Result<()> {
        for (i, &slot) in slots.iter().enumerate() {
            self.set_conv_row(slot, rows.get(i)?)?;
        }
        Ok(())
    }

    /// Inverse of [`gather_ssm`](Self::gather_ssm).
    pub fn scatter_ssm(&mut self, slots: &[usize], rows: &Tensor) -> Result<()> {
        for (i, &slot) in slots.iter().enumerate() {
            self.set_ssm_row(slot, rows.get(i)?)?;
        }
        Ok(())
    }

    fn reset(&mut self, slot: usize, conv_zero: &Tensor, ssm_zero: &Tensor) {
        self.conv_rows[slot] = conv_zero.clone();
        self.ssm_rows[slot] = ssm_zero.clone();
    }
}

/// Slot allocator plus per-layer row arena.
///
/// The number of slots is fixed at construction. Allocation hands out the
/// lowest free slot and zeroes its rows in every layer.
pub struct MambaStateCache {
    layers: Vec<MambaLayerState>,
    num_slots: usize,
    conv_zero: Tensor,
    ssm_zero: Tensor,
    free_slots: Vec<usize>,
    active: HashMap<u64, usize>,
}

impl MambaStateCache {
    /// # Arguments
    /// * `num_layers` - recurrent layers owned by this pipeline stage
    /// * `num_slots` - maximum concurrently active sequences
    /// * `conv_shape` - `(d_inner / tp, d_conv - 1)`
    /// * `ssm_shape` - `(d_inner / tp, d_state)`
    pub fn new(
        num_layers: usize,
        num_slots: usize,
        conv_shape: (usize, usize),
        ssm_shape: (usize, usize),
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let conv_zero = Tensor::zeros(conv_shape, dtype, device)?;
        let ssm_zero = Tensor::zeros(ssm_shape, dtype, device)?;
        let layers = (0..num_layers)
            .map(|_| MambaLayerState::zeroed(num_slots, &conv_zero, &ssm_zero))
            .collect();
        Ok(Self {
            layers,
            num_slots,
            conv_zero,
            ssm_zero,
            // popped from the back: lowest slot first
            free_slots: (0..num_slots).rev().collect(),
            active: HashMap::new(),
        })
    }

    /// Reserve a slot for `request_id` with zeroed rows.
    pub fn allocate(&mut self, request_id: u64) -> std::result::Result<usize, StateCacheError> {
        if self.active.contains_key(&request_id) {
            return Err(StateCacheError::RequestAlreadyExists(request_id));
        }
        let slot = self
            .free_slots
            .pop()
            .ok_or(StateCacheError::NoFreeSlots(self.num_slots))?;
        self.reset_rows(slot);
        self.active.insert(request_id, slot);
        tracing::debug!(request_id, slot, "allocated recurrent state slot");
        Ok(slot)
    }

    /// Release the slot held by `request_id`.
    pub fn free(&mut self, request_id: u64) -> std::result::Result<usize, StateCacheError> {
        let slot = self
            .active
            .remove(&request_id)
            .ok_or(StateCacheError::RequestNotFound(request_id))?;
        self.free_slots.push(slot);
        self.free_slots.sort_unstable_by(|a, b| b.cmp(a));
        Ok(slot)
    }

    pub fn slot_of(&self, request_id: u64) -> Option<usize> {
        self.active.get(&request_id).copied()
    }

    /// Zero the rows of `slot` in every layer.
    pub fn reset_slot(&mut self, slot: usize) -> std::result::Result<(), StateCacheError> {
        if slot >= self.num_slots {
            return Err(StateCacheError::SlotOutOfRange {
                slot,
                num_slots: self.num_slots,
            });
        }
        self.reset_rows(slot);
        Ok(())
    }

    fn reset_rows(&mut self, slot: usize) {
        for layer in &mut self.layers {
            layer.reset(slot, &self.conv_zero, &self.ssm_zero);
        }
    }

    pub fn layer(&self, recurrent_idx: usize) -> Option<&MambaLayerState> {
        self.layers.get(recurrent_idx)
    }

    pub fn layer_mut(&mut self, recurrent_idx: usize) -> Option<&mut MambaLayerState> {
        self.layers.get_mut(recurrent_idx)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn num_free_slots(&self) -> usize {
        self.free_slots.len()
    }

    pub fn num_active(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(layers: usize, slots: usize) -> MambaStateCache {
        MambaStateCache::new(layers, slots, (4, 3), (4, 2), DType::F32, &Device::Cpu).unwrap()
    }

    fn sum(t: &Tensor) -> f32 {
        t.sum_all().unwrap().to_scalar::<f32>().unwrap()
    }

    #[test]
    fn allocate_hands_out_lowest_free_slot() {
        let mut cache = cache(2, 3);
        assert_eq!(cache.allocate(10).unwrap(), 0);
        assert_eq!(cache.allocate(11).unwrap(), 1);
        assert_eq!(cache.free(10).unwrap(), 0);
        assert_eq!(cache.allocate(12).unwrap(), 0);
        assert_eq!(cache.slot_of(11), Some(1));
        assert_eq!(cache.num_active(), 2);
        assert_eq!(cache.num_free_slots(), 1);
    }

    #[test]
    fn allocation_errors() {
        let mut cache = cache(1, 1);
        cache.allocate(1).unwrap();
        assert!(matches!(
            cache.allocate(1),
            Err(StateCacheError::RequestAlreadyExists(1))
        ));
        assert!(matches!(cache.allocate(2), Err(StateCacheError::NoFreeSlots(1))));
        assert!(matches!(cache.free(7), Err(StateCacheError::RequestNotFound(7))));
        assert!(matches!(
            cache.reset_slot(5),
            Err(StateCacheError::SlotOutOfRange { slot: 5, num_slots: 1 })
        ));
    }

    #[test]
    fn reallocated_slot_is_zeroed() {
        let mut cache = cache(2, 2);
        let slot = cache.allocate(1).unwrap();
        let ones = Tensor::ones((4, 2), DType::F32, &Device::Cpu).unwrap();
        cache.layer_mut(1).unwrap().set_ssm_row(slot, ones).unwrap();
        assert_eq!(sum(cache.layer(1).unwrap().ssm_row(slot).unwrap()), 8.0);

        cache.free(1).unwrap();
        let again = cache.allocate(2).unwrap();
        assert_eq!(again, slot);
        assert_eq!(sum(cache.layer(1).unwrap().ssm_row(slot).unwrap()), 0.0);
    }

    #[test]
    fn gather_and_scatter_follow_slot_order() {
        let mut cache = cache(1, 3);
        let layer = cache.layer_mut(0).unwrap();
        let rows = Tensor::arange(0f32, 24.0, &Device::Cpu)
            .unwrap()
            .reshape((2, 4, 3))
            .unwrap();
        layer.scatter_conv(&[2, 0], &rows).unwrap();

        let back = layer.gather_conv(&[2, 0]).unwrap();
        let a: Vec<f32> = back.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = rows.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
        assert_eq!(sum(layer.conv_row(1).unwrap()), 0.0);
        assert_eq!(sum(layer.conv_row(2).unwrap()), (0..12).sum::<i32>() as f32);
    }

    #[test]
    fn row_writes_are_checked() {
        let mut cache = cache(1, 2);
        let layer = cache.layer_mut(0).unwrap();
        let wrong = Tensor::zeros((4, 5), DType::F32, &Device::Cpu).unwrap();
        assert!(layer.set_conv_row(0, wrong).is_err());
        assert!(layer.ssm_row(2).is_err());
        assert!(cache.layer_mut(1).is_none());
    }
}
