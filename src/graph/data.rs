use serde::{Deserialize, Serialize};

use crate::error::{BackwardError, Result};

/// Element type of an array or scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F16,
    F32,
    F64,
    I32,
    I64,
    Bool,
    Void,
    Ptr(Box<DType>),
}

impl DType {
    /// Pointer to this type.
    pub fn ptr(self) -> DType {
        DType::Ptr(Box::new(self))
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::F32 | DType::F64)
    }

    /// C++ spelling used by generated native code.
    pub fn c_name(&self) -> String {
        match self {
            DType::F16 => "half".to_string(),
            DType::F32 => "float".to_string(),
            DType::F64 => "double".to_string(),
            DType::I32 => "int".to_string(),
            DType::I64 => "int64_t".to_string(),
            DType::Bool => "bool".to_string(),
            DType::Void => "void".to_string(),
            DType::Ptr(inner) => format!("{} *", inner.c_name()),
        }
    }

    /// Builds a constant of this element type. Half-precision values are held
    /// as `F32`; integer types only take integral values.
    pub fn constant(&self, value: f64) -> Result<Const> {
        match self {
            DType::F16 | DType::F32 => Ok(Const::F32(value as f32)),
            DType::F64 => Ok(Const::F64(value)),
            DType::I32 | DType::I64 if value.fract() == 0.0 => Ok(Const::I64(value as i64)),
            DType::I32 | DType::I64 => Err(BackwardError::UnsupportedLayout(format!(
                "{value} is not representable as {self:?}"
            ))),
            other => Err(BackwardError::UnsupportedLayout(format!(
                "cannot build a constant of type {other:?}"
            ))),
        }
    }
}

/// A typed compile-time constant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Const {
    F32(f32),
    F64(f64),
    I64(i64),
}

impl Const {
    pub fn as_f64(&self) -> f64 {
        match self {
            Const::F32(v) => *v as f64,
            Const::F64(v) => *v,
            Const::I64(v) => *v as f64,
        }
    }
}

impl std::fmt::Display for Const {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Const::F32(v) => write!(f, "{v:?}f"),
            Const::F64(v) => write!(f, "{v:?}"),
            Const::I64(v) => write!(f, "{v}"),
        }
    }
}

/// Where an array lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Storage {
    #[default]
    Default,
    CpuHeap,
    Gpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataKind {
    Array,
    Scalar,
}

/// Shape, element type and storage classification of a named piece of data.
///
/// A non-transient descriptor is supplied from outside the graph that
/// declares it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataDesc {
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub transient: bool,
    pub storage: Storage,
    pub kind: DataKind,
}

impl DataDesc {
    pub fn array(shape: Vec<usize>, dtype: DType) -> Self {
        Self {
            shape,
            dtype,
            transient: false,
            storage: Storage::Default,
            kind: DataKind::Array,
        }
    }

    pub fn scalar(dtype: DType) -> Self {
        Self {
            shape: vec![1],
            dtype,
            transient: false,
            storage: Storage::Default,
            kind: DataKind::Scalar,
        }
    }

    pub fn with_transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }

    pub fn with_storage(mut self, storage: Storage) -> Self {
        self.storage = storage;
        self
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// The shape as a fixed NCHW quadruple.
    pub fn nchw(&self, connector: &str) -> Result<[usize; 4]> {
        match self.shape.as_slice() {
            [n, c, h, w] => Ok([*n, *c, *h, *w]),
            other => Err(BackwardError::UnsupportedRank {
                connector: connector.to_string(),
                expected: 4,
                actual: other.len(),
            }),
        }
    }
}
