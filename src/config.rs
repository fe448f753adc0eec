//! Backward-pass configuration
//!
//! Defaults can be overridden from the environment:
//! - `GRADWEAVE_BACKENDS`: comma-separated backend preference, e.g. `cudnn,pure`
//! - `GRADWEAVE_CONV_DATA_ALGO`: default convolution backward-data algorithm
//! - `GRADWEAVE_CONV_FILTER_ALGO`: default convolution backward-filter algorithm

use log::debug;
use serde::{Deserialize, Serialize};

use crate::backward::Backend;
use crate::error::{BackwardError, Result};
use crate::graph::{ConvBwdDataAlgo, ConvBwdFilterAlgo, DType};

/// Settings consulted by the backward pass when choosing and running strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackwardConfig {
    /// Backends to try, most preferred first.
    pub backends: Vec<Backend>,
    /// Backward-data algorithm used when a convolution node has no override.
    pub conv_data_algorithm: ConvBwdDataAlgo,
    /// Backward-filter algorithm used when a convolution node has no override.
    pub conv_filter_algorithm: ConvBwdFilterAlgo,
    /// Scalar type carrying cuDNN's `size_t` reserve-space size between the
    /// forward and backward batch-norm kernels. Must be 64 bits wide.
    pub reserved_size_dtype: DType,
}

impl Default for BackwardConfig {
    fn default() -> Self {
        Self {
            backends: vec![Backend::Cudnn, Backend::Pure],
            conv_data_algorithm: ConvBwdDataAlgo::default(),
            conv_filter_algorithm: ConvBwdFilterAlgo::default(),
            reserved_size_dtype: DType::I64,
        }
    }
}

impl BackwardConfig {
    /// Defaults with `GRADWEAVE_*` environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(backends) = std::env::var("GRADWEAVE_BACKENDS") {
            config.backends = parse_backends(&backends)?;
        }
        if let Ok(algo) = std::env::var("GRADWEAVE_CONV_DATA_ALGO") {
            config.conv_data_algorithm = algo.parse()?;
        }
        if let Ok(algo) = std::env::var("GRADWEAVE_CONV_FILTER_ALGO") {
            config.conv_filter_algorithm = algo.parse()?;
        }
        debug!("backward config: {config:?}");
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| BackwardError::Config(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| BackwardError::Config(e.to_string()))
    }

    pub fn with_backends(mut self, backends: Vec<Backend>) -> Self {
        self.backends = backends;
        self
    }
}

fn parse_backends(list: &str) -> Result<Vec<Backend>> {
    let backends = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect::<Result<Vec<Backend>>>()?;
    if backends.is_empty() {
        return Err(BackwardError::Config("empty backend list".to_string()));
    }
    Ok(backends)
}
