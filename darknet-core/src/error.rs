//! Typed failures raised while parsing a cfg or compiling a network.
//!
//! Public functions return `anyhow::Result`; these variants travel inside the
//! `anyhow::Error` so callers can `downcast_ref::<BuildError>()` when they need
//! to tell a malformed description apart from bad weights.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BuildError {
    #[error("cfg line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("block {block} ({block_type}) is missing required field '{field}'")]
    MissingField {
        block: usize,
        block_type: String,
        field: String,
    },

    #[error("block {block} ({block_type}): invalid value '{value}' for '{field}'")]
    InvalidField {
        block: usize,
        block_type: String,
        field: String,
        value: String,
    },

    #[error("block {block}: unsupported layer type '{block_type}'")]
    UnsupportedLayer { block: usize, block_type: String },

    #[error("block {block}: unsupported activation '{activation}'")]
    UnsupportedActivation { block: usize, activation: String },

    #[error("block {block}: layer reference {reference} is out of range ({available} layers built)")]
    IndexOutOfRange {
        block: usize,
        reference: i64,
        available: usize,
    },

    #[error(
        "block {block}: weights exhausted (need {requested} floats at offset {position}, file holds {total})"
    )]
    WeightsExhausted {
        block: usize,
        requested: usize,
        position: usize,
        total: usize,
    },

    #[error("weights file has {unused} unused floats (consumed {consumed} of {total})")]
    UnusedWeights {
        consumed: usize,
        total: usize,
        unused: usize,
    },

    #[error("expected {expected} detection heads but built {found}")]
    HeadCountMismatch { expected: usize, found: usize },

    #[error("weights payload of {bytes} bytes is not a whole number of floats")]
    WeightsLength { bytes: usize },
}
