//! Per-block graph emitters.
//!
//! Each function adds the nodes for one cfg block to a [`NetworkDefinition`]
//! and returns the block's output tensor. Weight-bearing layers pull their
//! arrays from the shared [`WeightCursor`](crate::weights::WeightCursor).

mod activation;
mod batchnorm;
mod channels;
mod convolutional;
mod implicit;
mod pooling;
mod reorg;
mod route;
mod sam;
mod shortcut;
mod upsample;

pub use activation::activation_layer;
pub use batchnorm::{batchnorm_layer, fold_batch_norm};
pub use channels::{ChannelOp, channels_layer};
pub use convolutional::convolutional_layer;
pub use implicit::implicit_layer;
pub use pooling::{avgpool_layer, maxpool_layer, maxpool_padding};
pub use reorg::{reorg3d_layer, reorg_layer};
pub use route::route_layer;
pub use sam::sam_layer;
pub use shortcut::shortcut_layer;
pub use upsample::upsample_layer;
