use std::path::Path;

use anyhow::{Context, Result};
use log::{Level, debug, info};
use ndarray::{Array4, ArrayD};

use crate::{
    builder::{BuiltNetwork, build_network},
    config::DarknetConfig,
    graph::{NetworkGraph, Node},
    network::TensorId,
    runtime::{CpuRuntime, RuntimeOutputs},
    weights::{WeightBuffer, load_weights},
};
use darknet_utils::timing_guard;

/// A compiled Darknet network together with the CPU executor that runs it.
#[derive(Debug, Clone)]
pub struct DarknetModel {
    config: DarknetConfig,
    built: BuiltNetwork,
    runtime: CpuRuntime,
}

impl DarknetModel {
    /// Parse `cfg_path`, load the matching weights and compile the graph.
    pub fn load<P, Q>(cfg_path: P, weights_path: Q) -> Result<Self>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        Self::load_with_batch(cfg_path, weights_path, None)
    }

    /// Same as [`Self::load`], replacing the `[net]` batch size when `batch` is set.
    pub fn load_with_batch<P, Q>(
        cfg_path: P,
        weights_path: Q,
        batch: Option<usize>,
    ) -> Result<Self>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        let cfg_path = cfg_path.as_ref();
        let weights_path = weights_path.as_ref();
        anyhow::ensure!(
            cfg_path.exists(),
            "cfg file not found: {}",
            cfg_path.display()
        );
        anyhow::ensure!(
            weights_path.exists(),
            "weights file not found: {}",
            weights_path.display()
        );

        let mut config = {
            let _guard = timing_guard("darknet_core::parse_cfg", Level::Debug);
            DarknetConfig::from_path(cfg_path)
                .with_context(|| format!("failed to parse {}", cfg_path.display()))?
        };
        if let Some(batch) = batch {
            anyhow::ensure!(batch > 0, "batch size must be positive");
            debug!("Overriding [net] batch {} with {batch}", config.net.batch);
            config.net.batch = batch;
        }
        let weights = {
            let _guard = timing_guard("darknet_core::load_weights", Level::Debug);
            load_weights(weights_path, &config.model_name)?
        };
        debug!(
            "Loaded {} weights for '{}' from {}",
            weights.len(),
            config.model_name,
            weights_path.display()
        );
        Self::compile(config, &weights)
            .with_context(|| format!("failed to build network from {}", cfg_path.display()))
    }

    /// Compile an already parsed config against an in-memory weight buffer.
    pub fn compile(config: DarknetConfig, weights: &WeightBuffer) -> Result<Self> {
        let mut graph = NetworkGraph::new();
        let built = build_network(&config, weights, &mut graph)?;
        info!(
            "Model '{}' ready: {} nodes, {} parameters, {} output rows",
            config.model_name,
            graph.nodes().len(),
            graph.parameter_count(),
            built.output_rows()
        );
        Ok(Self {
            config,
            built,
            runtime: CpuRuntime::new(graph),
        })
    }

    pub fn config(&self) -> &DarknetConfig {
        &self.config
    }

    pub fn built(&self) -> &BuiltNetwork {
        &self.built
    }

    pub fn graph(&self) -> &NetworkGraph {
        self.runtime.graph()
    }

    /// Expected input tensor dims `[B, C, H, W]`.
    pub fn input_dims(&self) -> [usize; 4] {
        let net = &self.config.net;
        [net.batch, net.channels, net.height, net.width]
    }

    /// Run one batch and return the graph outputs (`boxes`, `scores`, `classes`,
    /// or `output` for a network without heads).
    pub fn run(&self, input: Array4<f32>) -> Result<RuntimeOutputs> {
        self.run_observed(input, |_, _, _| {})
    }

    /// Run one batch, passing every intermediate tensor to `observer`.
    pub fn run_observed<F>(&self, input: Array4<f32>, observer: F) -> Result<RuntimeOutputs>
    where
        F: FnMut(&Node, TensorId, &ArrayD<f32>),
    {
        let expected = self.input_dims();
        anyhow::ensure!(
            input.shape() == expected,
            "input tensor has shape {:?}; network expects {:?}",
            input.shape(),
            expected
        );
        let _guard = timing_guard("darknet_core::inference", Level::Debug);
        self.runtime.run_observed(input.into_dyn(), observer)
    }
}
