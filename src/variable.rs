use crate::autograd::node::WeakGradNode;
use crate::error::AutogradError;
use crate::tensor_data::TensorData;
use crate::types::DType;
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Stable identity of a variable for use as a key in the engine's registries.
///
/// We use the raw pointer to the `RwLock<VariableData>` inside the variable's
/// `Arc` as the identifier: it stays valid while any clone of the handle (or
/// any accumulator holding one) keeps the `Arc` alive, and it is `Hash + Eq`
/// so it can key `HashMap`s without owning the variable.
pub type VarId = *const RwLock<VariableData>;

/// Hook invoked after a leaf variable's gradient has been fully accumulated.
///
/// Hooks may only be attached to leaves; the engine rejects a hooked variable
/// that has a producer node during dependency analysis.
pub trait BackwardHook: Debug + Send + Sync {
    /// Called once per backward pass with the finished gradient variable.
    fn on_grad_ready(&self, grad: &Variable);
}

/// Metadata and value storage for one variable wrapper.
///
/// Created by the forward recorder; the engine reads it and, at execution
/// time, writes gradient values into it. A gradient variable's
/// `producer_node` is the backward node recorded by the forward operation
/// that produced the primal, i.e. the node that consumes this gradient as
/// input. Leaves have no producer node.
pub struct VariableData {
    pub(crate) name: String,
    pub(crate) dtype: DType,
    /// Declared shape, known at record time even before a value is written.
    pub(crate) shape: Vec<usize>,
    /// This wrapper carries a gradient, not a primal.
    pub(crate) is_grad: bool,
    /// Halts propagation through this variable even if a backward op exists.
    pub(crate) stop_gradient: bool,
    /// Weak back handle to the producing backward node. The recorder owns
    /// the nodes; the engine upgrades this on demand.
    pub(crate) producer_node: Option<WeakGradNode>,
    /// Set when a non-retained backward pass has consumed the graph.
    pub(crate) graph_freed: bool,
    /// Inplace version of the wrapped tensor captured at forward time.
    pub(crate) version_snapshot: u32,
    pub(crate) leaf_hooks: Vec<Arc<dyn BackwardHook>>,
    /// The wrapped tensor value. `None` until written (uninitialized).
    pub(crate) value: Option<TensorData>,
    /// For a primal variable, the gradient variable associated with it.
    pub(crate) grad_var: Option<Variable>,
}

/// Handle to a variable participating in gradient computation.
///
/// Uses `Arc<RwLock<VariableData>>` for shared ownership and interior
/// mutability, so op input/output maps, accumulators, and user code can all
/// refer to the same underlying variable.
pub struct Variable {
    pub(crate) data: Arc<RwLock<VariableData>>,
}

impl Variable {
    /// Creates a primal variable with a declared shape and dtype.
    pub fn new(name: impl Into<String>, dtype: DType, shape: Vec<usize>) -> Self {
        Self::build(name.into(), dtype, shape, false)
    }

    /// Creates a gradient variable with a declared shape and dtype.
    pub fn new_grad(name: impl Into<String>, dtype: DType, shape: Vec<usize>) -> Self {
        Self::build(name.into(), dtype, shape, true)
    }

    fn build(name: String, dtype: DType, shape: Vec<usize>, is_grad: bool) -> Self {
        Variable {
            data: Arc::new(RwLock::new(VariableData {
                name,
                dtype,
                shape,
                is_grad,
                stop_gradient: false,
                producer_node: None,
                graph_freed: false,
                version_snapshot: 0,
                leaf_hooks: Vec::new(),
                value: None,
                grad_var: None,
            })),
        }
    }

    /// Fresh gradient variable with this variable's name, dtype and shape
    /// but no value. Used by the engine for temporary output slots.
    pub(crate) fn temp_like(&self) -> Variable {
        let guard = self.read_data();
        Variable::new_grad(guard.name.clone(), guard.dtype, guard.shape.clone())
    }

    pub(crate) fn read_data(&self) -> RwLockReadGuard<'_, VariableData> {
        self.data.read().expect("variable lock poisoned")
    }

    pub(crate) fn write_data(&self) -> RwLockWriteGuard<'_, VariableData> {
        self.data.write().expect("variable lock poisoned")
    }

    /// Stable identity key for engine registries.
    pub fn id(&self) -> VarId {
        Arc::as_ptr(&self.data)
    }

    /// Whether the two handles refer to the same underlying variable.
    pub fn ptr_eq(&self, other: &Variable) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    pub fn name(&self) -> String {
        self.read_data().name.clone()
    }

    pub fn dtype(&self) -> DType {
        self.read_data().dtype
    }

    pub fn shape(&self) -> Vec<usize> {
        self.read_data().shape.clone()
    }

    pub fn is_grad(&self) -> bool {
        self.read_data().is_grad
    }

    /// A leaf has no producing backward node, typically a user parameter.
    pub fn is_leaf(&self) -> bool {
        self.read_data().producer_node.is_none()
    }

    pub fn stop_gradient(&self) -> bool {
        self.read_data().stop_gradient
    }

    pub fn set_stop_gradient(&self, stop: bool) {
        self.write_data().stop_gradient = stop;
    }

    /// The weak handle to the producing backward node, if any.
    pub fn producer_node(&self) -> Option<WeakGradNode> {
        self.read_data().producer_node.clone()
    }

    pub fn set_producer_node(&self, node: WeakGradNode) {
        self.write_data().producer_node = Some(node);
    }

    /// Detaches the variable from its producing node. After this the
    /// variable is a leaf again and the graph behind it can be dropped.
    pub fn detach_producer_node(&self) {
        self.write_data().producer_node = None;
    }

    pub fn graph_freed(&self) -> bool {
        self.read_data().graph_freed
    }

    pub fn set_graph_freed(&self, freed: bool) {
        self.write_data().graph_freed = freed;
    }

    /// The gradient variable associated with this primal, if allocated.
    pub fn grad_var(&self) -> Option<Variable> {
        self.read_data().grad_var.clone()
    }

    pub fn set_grad_var(&self, grad: Variable) {
        self.write_data().grad_var = Some(grad);
    }

    pub fn has_leaf_hooks(&self) -> bool {
        !self.read_data().leaf_hooks.is_empty()
    }

    pub fn leaf_hooks(&self) -> Vec<Arc<dyn BackwardHook>> {
        self.read_data().leaf_hooks.clone()
    }

    pub fn add_leaf_hook(&self, hook: Arc<dyn BackwardHook>) {
        self.write_data().leaf_hooks.push(hook);
    }

    /// Whether a tensor value has been written to this variable.
    pub fn has_value(&self) -> bool {
        self.read_data().value.is_some()
    }

    /// Clones out the current tensor value, if any.
    pub fn value(&self) -> Option<TensorData> {
        self.read_data().value.clone()
    }

    /// Installs a tensor value, replacing any previous one.
    pub fn set_value(&self, tensor: TensorData) {
        self.write_data().value = Some(tensor);
    }

    /// Moves the tensor value out, leaving the variable uninitialized.
    pub fn take_value(&self) -> Option<TensorData> {
        self.write_data().value.take()
    }

    /// Runs `f` with mutable access to the value slot. Used by accumulators
    /// to adopt or add into the stored tensor without cloning it.
    pub(crate) fn modify_value<R>(&self, f: impl FnOnce(&mut Option<TensorData>) -> R) -> R {
        f(&mut self.write_data().value)
    }

    /// Shape, dtype and device of the wrapped primal value, if allocated.
    /// Used by the engine to size the seed gradient.
    pub fn primal_shape_and_dtype(
        &self,
    ) -> Option<(Vec<usize>, crate::types::DType, crate::device::StorageDevice)> {
        self.read_data()
            .value
            .as_ref()
            .map(|t| (t.shape.clone(), t.dtype(), t.device()))
    }

    /// Current inplace version of the wrapped tensor (0 when uninitialized).
    pub fn inplace_version(&self) -> u32 {
        self.read_data()
            .value
            .as_ref()
            .map(|t| t.inplace_version())
            .unwrap_or(0)
    }

    /// The version captured when this variable was recorded.
    pub fn version_snapshot(&self) -> u32 {
        self.read_data().version_snapshot
    }

    /// Captures the wrapped tensor's current inplace version as the
    /// snapshot the engine will verify against during backward.
    pub fn snapshot_version(&self) {
        let mut guard = self.write_data();
        guard.version_snapshot = guard.value.as_ref().map(|t| t.inplace_version()).unwrap_or(0);
    }

    /// Records one destructive mutation of the wrapped tensor.
    pub fn bump_inplace_version(&self) -> Result<(), AutogradError> {
        let mut guard = self.write_data();
        match guard.value.as_mut() {
            Some(tensor) => {
                tensor.bump_inplace_version();
                Ok(())
            }
            None => Err(AutogradError::Internal(format!(
                "cannot bump inplace version of uninitialized variable '{}'",
                guard.name
            ))),
        }
    }
}

impl Clone for Variable {
    fn clone(&self) -> Self {
        Variable {
            data: Arc::clone(&self.data),
        }
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Variable {}

impl Hash for Variable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // try_read so Debug stays safe while a guard is held elsewhere
        match self.data.try_read() {
            Ok(guard) => f
                .debug_struct("Variable")
                .field("name", &guard.name)
                .field("dtype", &guard.dtype)
                .field("is_grad", &guard.is_grad)
                .field("stop_gradient", &guard.stop_gradient)
                .field("leaf", &guard.producer_node.is_none())
                .field("initialized", &guard.value.is_some())
                .finish(),
            Err(_) => f.debug_struct("Variable").field("locked", &true).finish(),
        }
    }
}
