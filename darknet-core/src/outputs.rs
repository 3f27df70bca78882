//! Per-layer output arena used to resolve back-references (`from`, `layers`).

use crate::{error::BuildError, network::TensorId};

/// Darknet layer number (0-based, `[net]` excluded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerIndex(pub usize);

/// Append-only list of the tensor each processed layer produced.
#[derive(Debug, Clone, Default)]
pub struct TensorOutputs {
    tensors: Vec<TensorId>,
}

impl TensorOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn push(&mut self, tensor: TensorId) -> LayerIndex {
        self.tensors.push(tensor);
        LayerIndex(self.tensors.len() - 1)
    }

    pub fn get(&self, index: LayerIndex) -> Option<TensorId> {
        self.tensors.get(index.0).copied()
    }

    /// Turn a cfg reference into an index: negative values count back from the
    /// end, non-negative values are absolute layer numbers.
    pub fn resolve(&self, reference: i64, block: usize) -> Result<LayerIndex, BuildError> {
        let available = self.tensors.len();
        let resolved = if reference < 0 {
            (available as i64).checked_add(reference)
        } else {
            Some(reference)
        };
        match resolved {
            Some(idx) if idx >= 0 && (idx as usize) < available => Ok(LayerIndex(idx as usize)),
            _ => Err(BuildError::IndexOutOfRange {
                block,
                reference,
                available,
            }),
        }
    }

    /// Resolve `reference` and return the tensor stored there.
    pub fn lookup(&self, reference: i64, block: usize) -> Result<(LayerIndex, TensorId), BuildError> {
        let index = self.resolve(reference, block)?;
        Ok((index, self.tensors[index.0]))
    }
}
