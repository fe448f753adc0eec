//! Built-in backward strategies

mod batchnorm;
mod contraction;
mod conv;
mod pooling;
mod softmax;

pub use batchnorm::CudnnBatchNormBackward;
pub use contraction::EinsumBackward;
pub use conv::CudnnConvBackward;
pub use pooling::GlobalAveragePoolBackward;
pub use softmax::{LogSoftmaxBackward, SoftmaxBackward};
