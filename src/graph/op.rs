use serde::{Deserialize, Serialize};

use crate::error::BackwardError;

/// Backward-data algorithm variant for accelerated convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvBwdDataAlgo {
    #[default]
    Algo0,
    Algo1,
    Fft,
    FftTiling,
    Winograd,
    WinogradNonfused,
}

impl ConvBwdDataAlgo {
    /// Suffix of the `CUDNN_CONVOLUTION_BWD_DATA_ALGO_*` enumerator.
    pub fn cudnn_suffix(&self) -> &'static str {
        match self {
            ConvBwdDataAlgo::Algo0 => "0",
            ConvBwdDataAlgo::Algo1 => "1",
            ConvBwdDataAlgo::Fft => "FFT",
            ConvBwdDataAlgo::FftTiling => "FFT_TILING",
            ConvBwdDataAlgo::Winograd => "WINOGRAD",
            ConvBwdDataAlgo::WinogradNonfused => "WINOGRAD_NONFUSED",
        }
    }
}

impl std::str::FromStr for ConvBwdDataAlgo {
    type Err = BackwardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "algo0" => Ok(ConvBwdDataAlgo::Algo0),
            "1" | "algo1" => Ok(ConvBwdDataAlgo::Algo1),
            "fft" => Ok(ConvBwdDataAlgo::Fft),
            "fft_tiling" => Ok(ConvBwdDataAlgo::FftTiling),
            "winograd" => Ok(ConvBwdDataAlgo::Winograd),
            "winograd_nonfused" => Ok(ConvBwdDataAlgo::WinogradNonfused),
            other => Err(BackwardError::Config(format!(
                "unknown backward-data algorithm '{other}'"
            ))),
        }
    }
}

/// Backward-filter algorithm variant for accelerated convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvBwdFilterAlgo {
    #[default]
    Algo0,
    Algo1,
    Fft,
    FftTiling,
    Algo3,
    WinogradNonfused,
}

impl ConvBwdFilterAlgo {
    /// Suffix of the `CUDNN_CONVOLUTION_BWD_FILTER_ALGO_*` enumerator.
    pub fn cudnn_suffix(&self) -> &'static str {
        match self {
            ConvBwdFilterAlgo::Algo0 => "0",
            ConvBwdFilterAlgo::Algo1 => "1",
            ConvBwdFilterAlgo::Fft => "FFT",
            ConvBwdFilterAlgo::FftTiling => "FFT_TILING",
            ConvBwdFilterAlgo::Algo3 => "3",
            ConvBwdFilterAlgo::WinogradNonfused => "WINOGRAD_NONFUSED",
        }
    }
}

impl std::str::FromStr for ConvBwdFilterAlgo {
    type Err = BackwardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "algo0" => Ok(ConvBwdFilterAlgo::Algo0),
            "1" | "algo1" => Ok(ConvBwdFilterAlgo::Algo1),
            "fft" => Ok(ConvBwdFilterAlgo::Fft),
            "fft_tiling" => Ok(ConvBwdFilterAlgo::FftTiling),
            "3" | "algo3" => Ok(ConvBwdFilterAlgo::Algo3),
            "winograd_nonfused" => Ok(ConvBwdFilterAlgo::WinogradNonfused),
            other => Err(BackwardError::Config(format!(
                "unknown backward-filter algorithm '{other}'"
            ))),
        }
    }
}

/// Attributes of a 2D convolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvAttrs {
    /// `[top, left, bottom, right]`
    pub pads: [usize; 4],
    pub strides: [usize; 2],
    pub dilations: [usize; 2],
    pub group: usize,
    /// Per-node override of the backward-data algorithm.
    pub data_algorithm: Option<ConvBwdDataAlgo>,
    /// Per-node override of the backward-filter algorithm.
    pub filter_algorithm: Option<ConvBwdFilterAlgo>,
}

impl Default for ConvAttrs {
    fn default() -> Self {
        Self {
            pads: [0; 4],
            strides: [1, 1],
            dilations: [1, 1],
            group: 1,
            data_algorithm: None,
            filter_algorithm: None,
        }
    }
}

impl ConvAttrs {
    pub fn is_symmetric(&self) -> bool {
        self.pads[0] == self.pads[2] && self.pads[1] == self.pads[3]
    }
}

/// Attributes of batch normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormAttrs {
    pub epsilon: f64,
    pub momentum: f64,
    /// When set, the forward lowering also writes the kernel's reserve space
    /// to the `reserved_ptr` and `reserved_size` connectors.
    pub expose_reserve_space: bool,
}

impl Default for BatchNormAttrs {
    fn default() -> Self {
        Self {
            epsilon: 1e-5,
            momentum: 0.9,
            expose_reserve_space: false,
        }
    }
}

/// Tensor operators a graph can hold.
///
/// Connector names follow the ONNX operator signatures; variadic inputs are
/// named `<param>__<index>`.
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    /// `Inputs__0..Inputs__k -> Output`
    Einsum { equation: String },
    /// `input -> output`
    Softmax { axis: i64 },
    /// `input -> output`
    LogSoftmax { axis: i64 },
    /// `X, W, [B] -> Y`
    Conv(ConvAttrs),
    /// `X, scale, B, input_mean, input_var -> Y, running_mean, running_var, saved_mean, saved_var`
    BatchNormalization(BatchNormAttrs),
    /// `X -> Y`
    GlobalAveragePool,
    /// `A, B -> C`
    Mul,
    /// `A, B -> C`
    Sub,
    /// `input -> output`
    Exp,
    /// `data -> reduced`
    ReduceSum { axes: Vec<i64>, keepdims: bool },
}

impl Operator {
    /// Operator kind used as the registry key.
    pub fn kind(&self) -> &'static str {
        match self {
            Operator::Einsum { .. } => "Einsum",
            Operator::Softmax { .. } => "Softmax",
            Operator::LogSoftmax { .. } => "LogSoftmax",
            Operator::Conv(_) => "Conv",
            Operator::BatchNormalization(_) => "BatchNormalization",
            Operator::GlobalAveragePool => "GlobalAveragePool",
            Operator::Mul => "Mul",
            Operator::Sub => "Sub",
            Operator::Exp => "Exp",
            Operator::ReduceSum { .. } => "ReduceSum",
        }
    }
}

/// Splits a variadic connector name such as `Inputs__3` into `("Inputs", 3)`.
pub fn parse_variadic_param(connector: &str) -> Option<(&str, usize)> {
    let (name, index) = connector.rsplit_once("__")?;
    Some((name, index.parse().ok()?))
}

/// Normalizes a possibly negative axis against `rank`.
pub fn normalize_axis(axis: i64, rank: usize) -> Option<usize> {
    let rank = rank as i64;
    let axis = if axis < 0 { axis + rank } else { axis };
    (0..rank).contains(&axis).then_some(axis as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Inputs__0", Some(("Inputs", 0)))]
    #[case("Inputs__12", Some(("Inputs", 12)))]
    #[case("Output", None)]
    #[case("Inputs__x", None)]
    fn test_parse_variadic_param(#[case] connector: &str, #[case] expected: Option<(&str, usize)>) {
        assert_eq!(parse_variadic_param(connector), expected);
    }

    #[rstest]
    #[case(1, 2, Some(1))]
    #[case(-1, 2, Some(1))]
    #[case(-2, 2, Some(0))]
    #[case(2, 2, None)]
    #[case(-3, 2, None)]
    fn test_normalize_axis(#[case] axis: i64, #[case] rank: usize, #[case] expected: Option<usize>) {
        assert_eq!(normalize_axis(axis, rank), expected);
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!("fft_tiling".parse::<ConvBwdDataAlgo>().unwrap().cudnn_suffix(), "FFT_TILING");
        assert_eq!("3".parse::<ConvBwdFilterAlgo>().unwrap(), ConvBwdFilterAlgo::Algo3);
        assert!("winograd".parse::<ConvBwdFilterAlgo>().is_err());
    }
}
