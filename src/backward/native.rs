//! Native cuDNN code emission
//!
//! Accelerated strategies emit a [`NativeKernel`] whose per-node resources
//! (descriptors, workspace) live in `__state` fields. A [`DescriptorBundle`]
//! owns the list of those resources and generates the state-field
//! declarations, the init block that creates them and the exit block that
//! releases them, so every creation has exactly one release.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write};

use log::debug;

use crate::error::{BackwardError, Result};
use crate::graph::{ConvAttrs, DType, NativeKernel};

/// Native library tag attached to emitted kernels.
pub const CUDNN_ENVIRONMENT: &str = "cuDNN";
/// Checked-call wrapper used around every cuDNN call.
pub const CHECK: &str = "gradweave::cudnn::CheckCudnnError";
/// Name of the library handle inside generated code.
pub const HANDLE: &str = "__gradweave_cudnn_handle";

/// Identifier of a node by its position: graph id, state id, node id.
///
/// Used as a prefix for every native resource of that node so two
/// instances of the same operator never share a handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeUid {
    label: String,
    pub graph: usize,
    pub state: usize,
    pub node: usize,
}

impl NodeUid {
    pub fn new(name: &str, graph: usize, state: usize, node: usize) -> Self {
        Self {
            label: clean_name(name),
            graph,
            state,
            node,
        }
    }

    /// Prefix for the resources of this node's backward kernel.
    pub fn backward(&self) -> String {
        format!("{self}_bwd")
    }
}

impl fmt::Display for NodeUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}_{}", self.label, self.graph, self.state, self.node)
    }
}

/// Turns an operator name into a valid C identifier fragment.
pub fn clean_name(name: &str) -> String {
    let mut cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if cleaned.is_empty() || cleaned.starts_with(|c: char| c.is_ascii_digit()) {
        cleaned.insert(0, '_');
    }
    cleaned
}

pub fn cudnn_supported(dtype: &DType) -> bool {
    cudnn_dtype(dtype).is_ok()
}

pub fn cudnn_dtype(dtype: &DType) -> Result<&'static str> {
    match dtype {
        DType::F16 => Ok("CUDNN_DATA_HALF"),
        DType::F32 => Ok("CUDNN_DATA_FLOAT"),
        DType::F64 => Ok("CUDNN_DATA_DOUBLE"),
        other => Err(BackwardError::UnsupportedLayout(format!(
            "cuDNN has no data type for {other:?}"
        ))),
    }
}

/// Checks that `dtype` can hold a `size_t` handed over by cuDNN.
pub fn check_size_carrier(dtype: &DType) -> Result<()> {
    match dtype {
        DType::I64 => Ok(()),
        other => Err(BackwardError::UnsupportedLayout(format!(
            "{other:?} cannot carry a 64-bit size_t"
        ))),
    }
}

/// Code that binds the library handle inside a generated block.
pub fn handle_setup_code(set_stream: bool) -> String {
    let mut code = format!("cudnnHandle_t &{HANDLE} = __state->cudnn_handle;\n");
    if set_stream {
        writeln!(code, "{CHECK}(cudnnSetStream({HANDLE}, __stream));").unwrap();
    }
    code
}

/// One `__state` field plus the code creating and releasing it.
#[derive(Debug, Clone, PartialEq)]
struct Handle {
    field: String,
    c_type: String,
    init: String,
    exit: String,
}

/// Size query contributing to the shared workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceQuery {
    /// Local `size_t` the query writes.
    pub var: String,
    /// The cuDNN call, taking `&var` as its last argument.
    pub call: String,
}

/// Per-node native resources of one generated kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorBundle {
    prefix: String,
    handles: Vec<Handle>,
}

impl DescriptorBundle {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            handles: Vec::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Field name of the resource `key`.
    pub fn field(&self, key: &str) -> String {
        format!("{}_{key}", self.prefix)
    }

    /// `*__state-><field>`, the value of a descriptor resource.
    pub fn deref(&self, key: &str) -> String {
        format!("*__state->{}", self.field(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        let field = self.field(key);
        self.handles.iter().any(|h| h.field == field)
    }

    fn push(&mut self, handle: Handle) {
        debug_assert!(
            !self.handles.iter().any(|h| h.field == handle.field),
            "duplicate native resource {}",
            handle.field
        );
        self.handles.push(handle);
    }

    /// NCHW tensor descriptor.
    pub fn tensor(&mut self, key: &str, shape: [usize; 4], dtype: &DType) -> Result<()> {
        let field = self.field(key);
        let dt = cudnn_dtype(dtype)?;
        let [n, c, h, w] = shape;
        let mut init = String::new();
        writeln!(init, "__state->{field} = new cudnnTensorDescriptor_t;").unwrap();
        writeln!(init, "{CHECK}(cudnnCreateTensorDescriptor(__state->{field}));").unwrap();
        writeln!(
            init,
            "{CHECK}(cudnnSetTensor4dDescriptor(*__state->{field}, CUDNN_TENSOR_NCHW, {dt}, {n}, {c}, {h}, {w}));"
        )
        .unwrap();
        let mut exit = String::new();
        writeln!(exit, "{CHECK}(cudnnDestroyTensorDescriptor(*__state->{field}));").unwrap();
        writeln!(exit, "delete __state->{field};").unwrap();
        self.push(Handle {
            field,
            c_type: "cudnnTensorDescriptor_t".to_string(),
            init,
            exit,
        });
        Ok(())
    }

    /// KCHW filter descriptor.
    pub fn filter(&mut self, key: &str, shape: [usize; 4], dtype: &DType) -> Result<()> {
        let field = self.field(key);
        let dt = cudnn_dtype(dtype)?;
        let [k, c, h, w] = shape;
        let mut init = String::new();
        writeln!(init, "__state->{field} = new cudnnFilterDescriptor_t;").unwrap();
        writeln!(init, "{CHECK}(cudnnCreateFilterDescriptor(__state->{field}));").unwrap();
        writeln!(
            init,
            "{CHECK}(cudnnSetFilter4dDescriptor(*__state->{field}, {dt}, CUDNN_TENSOR_NCHW, {k}, {c}, {h}, {w}));"
        )
        .unwrap();
        let mut exit = String::new();
        writeln!(exit, "{CHECK}(cudnnDestroyFilterDescriptor(*__state->{field}));").unwrap();
        writeln!(exit, "delete __state->{field};").unwrap();
        self.push(Handle {
            field,
            c_type: "cudnnFilterDescriptor_t".to_string(),
            init,
            exit,
        });
        Ok(())
    }

    /// 2D cross-correlation descriptor. Padding must be symmetric.
    pub fn convolution(&mut self, key: &str, attrs: &ConvAttrs, dtype: &DType) -> Result<()> {
        if !attrs.is_symmetric() {
            return Err(BackwardError::UnsupportedLayout(format!(
                "asymmetric padding {:?}",
                attrs.pads
            )));
        }
        let field = self.field(key);
        let dt = cudnn_dtype(dtype)?;
        let [pad_h, pad_w, _, _] = attrs.pads;
        let [stride_h, stride_w] = attrs.strides;
        let [dilation_h, dilation_w] = attrs.dilations;
        let mut init = String::new();
        writeln!(init, "__state->{field} = new cudnnConvolutionDescriptor_t;").unwrap();
        writeln!(init, "{CHECK}(cudnnCreateConvolutionDescriptor(__state->{field}));").unwrap();
        writeln!(
            init,
            "{CHECK}(cudnnSetConvolution2dDescriptor(*__state->{field}, {pad_h}, {pad_w}, {stride_h}, {stride_w}, {dilation_h}, {dilation_w}, CUDNN_CROSS_CORRELATION, {dt}));"
        )
        .unwrap();
        let mut exit = String::new();
        writeln!(exit, "{CHECK}(cudnnDestroyConvolutionDescriptor(*__state->{field}));").unwrap();
        writeln!(exit, "delete __state->{field};").unwrap();
        self.push(Handle {
            field,
            c_type: "cudnnConvolutionDescriptor_t".to_string(),
            init,
            exit,
        });
        Ok(())
    }

    /// Per-channel descriptor derived from the tensor descriptor `from`.
    pub fn batchnorm_derived(&mut self, key: &str, from: &str) {
        let field = self.field(key);
        let source = self.deref(from);
        let mut init = String::new();
        writeln!(init, "__state->{field} = new cudnnTensorDescriptor_t;").unwrap();
        writeln!(init, "{CHECK}(cudnnCreateTensorDescriptor(__state->{field}));").unwrap();
        writeln!(
            init,
            "{CHECK}(cudnnDeriveBNTensorDescriptor(*__state->{field}, {source}, CUDNN_BATCHNORM_SPATIAL));"
        )
        .unwrap();
        let mut exit = String::new();
        writeln!(exit, "{CHECK}(cudnnDestroyTensorDescriptor(*__state->{field}));").unwrap();
        writeln!(exit, "delete __state->{field};").unwrap();
        self.push(Handle {
            field,
            c_type: "cudnnTensorDescriptor_t".to_string(),
            init,
            exit,
        });
    }

    /// Scratch workspace sized to the largest of `queries`.
    ///
    /// Adds the `workspace_size` and `workspace` resources; the queries may
    /// use every descriptor added before this call.
    pub fn workspace(&mut self, queries: &[WorkspaceQuery]) {
        let size_field = self.field("workspace_size");
        let ws_field = self.field("workspace");

        let mut init = handle_setup_code(false);
        writeln!(init, "// Setup workspace for {}", self.prefix).unwrap();
        writeln!(init, "size_t ws_size = 0;").unwrap();
        for query in queries {
            writeln!(init, "size_t {};", query.var).unwrap();
            writeln!(init, "{CHECK}({});", query.call).unwrap();
            writeln!(init, "ws_size = std::max(ws_size, {});", query.var).unwrap();
        }
        writeln!(init, "__state->{size_field} = new size_t;").unwrap();
        writeln!(init, "*__state->{size_field} = ws_size;").unwrap();
        self.push(Handle {
            field: size_field.clone(),
            c_type: "size_t".to_string(),
            init,
            exit: format!("delete __state->{size_field};\n"),
        });

        self.push(Handle {
            field: ws_field.clone(),
            c_type: "float".to_string(),
            init: format!("cudaMalloc(&__state->{ws_field}, *__state->{size_field});\n"),
            exit: format!("cudaFree(__state->{ws_field});\n"),
        });
    }

    /// Field names, in creation order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.handles.iter().map(|h| h.field.as_str())
    }

    pub fn state_fields(&self) -> Vec<String> {
        self.handles
            .iter()
            .map(|h| format!("{} *{};", h.c_type, h.field))
            .collect()
    }

    /// Creates every resource, in order.
    pub fn init_code(&self) -> String {
        let mut code = String::from("{\n");
        for handle in &self.handles {
            code.push_str(&handle.init);
        }
        code.push_str("}\n");
        code
    }

    /// Releases every resource, in reverse creation order.
    pub fn exit_code(&self) -> String {
        let mut code = String::from("{\n");
        for handle in self.handles.iter().rev() {
            code.push_str(&handle.exit);
        }
        code.push_str("}\n");
        code
    }

    /// Packages the bundle and a call block as a native kernel.
    pub fn into_kernel(
        self,
        label: String,
        inputs: BTreeMap<String, DType>,
        outputs: BTreeMap<String, DType>,
        code: String,
    ) -> NativeKernel {
        let kernel = NativeKernel {
            label,
            inputs,
            outputs,
            code,
            code_init: self.init_code(),
            code_exit: self.exit_code(),
            state_fields: self.state_fields(),
            environments: BTreeSet::from([CUDNN_ENVIRONMENT.to_string()]),
        };
        debug!(
            "\n--- Native kernel {} ---\n// init\n{}// call\n{}// exit\n{}-----------------------",
            kernel.label, kernel.code_init, kernel.code, kernel.code_exit
        );
        kernel
    }
}

/// Number of times `field` is created in `init` and released in `exit`.
fn lifecycle_counts(field: &str, init: &str, exit: &str) -> (usize, usize) {
    let created = init.matches(&format!("__state->{field} = new ")).count()
        + init.matches(&format!("cudaMalloc(&__state->{field},")).count();
    let released = exit.matches(&format!("delete __state->{field};")).count()
        + exit.matches(&format!("cudaFree(__state->{field});")).count();
    (created, released)
}

/// State fields of `kernel` that are not created exactly once in its init
/// block and released exactly once in its exit block.
pub fn unpaired_resources(kernel: &NativeKernel) -> Vec<String> {
    kernel
        .state_fields
        .iter()
        .filter_map(|decl| {
            let field = decl.trim_end_matches(';').rsplit('*').next()?.trim().to_string();
            let counts = lifecycle_counts(&field, &kernel.code_init, &kernel.code_exit);
            (counts != (1, 1)).then_some(field)
        })
        .collect()
}
