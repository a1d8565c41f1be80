//! Recorded backward graph structures.
//!
//! A [`GradNode`] is the unit the engine schedules: an ordered, non-empty
//! group of [`GradOp`]s that share execution lifetime, plus the list of
//! pending nodes that must run after it in reverse order. The forward
//! recorder owns the nodes (in a reference-counted container); variables and
//! pending lists hold weak back handles, so dropping the recorder's handles
//! releases the whole reverse graph without cycles.

use crate::autograd::kernel::GradKernel;
use crate::device::StorageDevice;
use crate::error::AutogradError;
use crate::variable::Variable;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

/// Stable identity of a node for use as a key in the engine's registries.
pub type NodeId = *const RwLock<GradNode>;

/// Shared handle to a backward node. The recorder keeps these alive for the
/// duration of the backward pass.
pub type GradNodeRef = Arc<RwLock<GradNode>>;

/// Weak back handle stored in variables and pending-node lists.
pub type WeakGradNode = Weak<RwLock<GradNode>>;

/// Identity key of a node handle.
pub fn node_id(node: &GradNodeRef) -> NodeId {
    Arc::as_ptr(node)
}

/// One named slot of an op's input or output map: an ordered list of
/// variables plus a flag telling whether the slot carries gradients.
///
/// Non-grad slots hold forward tensors captured for the backward formula
/// (e.g. the primal input of a square op); the engine skips them when
/// provisioning accumulators or zero-filling, but still version-checks them.
#[derive(Debug, Clone)]
pub struct SlotList {
    pub vars: Vec<Variable>,
    pub is_grad: bool,
}

impl SlotList {
    pub fn grad(vars: Vec<Variable>) -> Self {
        SlotList { vars, is_grad: true }
    }

    pub fn forward(vars: Vec<Variable>) -> Self {
        SlotList {
            vars,
            is_grad: false,
        }
    }
}

/// Named slot map of a backward op.
pub type SlotMap = HashMap<String, SlotList>;

/// Attribute value recorded alongside a backward op.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    F64(f64),
    I64(i64),
    Bool(bool),
    Str(String),
}

impl AttrValue {
    /// Reads the attribute as `f64`, if it holds one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::F64(v) => Some(*v),
            _ => None,
        }
    }
}

/// A single recorded backward operator instance.
#[derive(Debug)]
pub struct GradOp {
    op_type: String,
    /// Monotonic sequence number assigned at forward-record time. Sort key
    /// for deterministic accumulation.
    id: u64,
    ins: SlotMap,
    outs: SlotMap,
    attrs: HashMap<String, AttrValue>,
    place: StorageDevice,
    /// The opaque kernel. Dropped by `clear_backward_trace` together with
    /// the captured variable references.
    kernel: Option<Arc<dyn GradKernel>>,
}

impl GradOp {
    pub fn new(op_type: impl Into<String>, id: u64, kernel: Arc<dyn GradKernel>) -> Self {
        GradOp {
            op_type: op_type.into(),
            id,
            ins: SlotMap::new(),
            outs: SlotMap::new(),
            attrs: HashMap::new(),
            place: StorageDevice::CPU,
            kernel: Some(kernel),
        }
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn place(&self) -> StorageDevice {
        self.place
    }

    pub fn set_place(&mut self, place: StorageDevice) {
        self.place = place;
    }

    pub fn ins(&self) -> &SlotMap {
        &self.ins
    }

    pub fn outs(&self) -> &SlotMap {
        &self.outs
    }

    pub fn attrs(&self) -> &HashMap<String, AttrValue> {
        &self.attrs
    }

    pub fn add_input(&mut self, name: impl Into<String>, slot: SlotList) {
        self.ins.insert(name.into(), slot);
    }

    pub fn add_output(&mut self, name: impl Into<String>, slot: SlotList) {
        self.outs.insert(name.into(), slot);
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: AttrValue) {
        self.attrs.insert(name.into(), value);
    }

    pub(crate) fn kernel(&self) -> Option<&Arc<dyn GradKernel>> {
        self.kernel.as_ref()
    }

    /// An op recorded with neither inputs nor outputs is a recorder bug.
    pub fn enforce_has_in_out(&self) -> Result<(), AutogradError> {
        if self.ins.is_empty() && self.outs.is_empty() {
            return Err(AutogradError::Internal(format!(
                "grad op '{}' has no inputs and no outputs",
                self.op_type
            )));
        }
        Ok(())
    }

    /// Releases the backward trace: the kernel closure and the captured
    /// variable references. After this the op cannot run again.
    pub fn clear_backward_trace(&mut self) {
        self.kernel = None;
        self.ins.clear();
        self.outs.clear();
    }
}

/// An ordered, non-empty collection of backward ops scheduled as a unit.
#[derive(Debug, Default)]
pub struct GradNode {
    pub(crate) ops: Vec<GradOp>,
    /// The nodes that must run after this one in reverse order: the
    /// backward nodes of this node's grad-input producers, i.e. the edges
    /// out of this node in the reverse graph.
    pub(crate) grad_pending_nodes: Vec<WeakGradNode>,
    /// Output slot names that alias input slot names, marking an in-place
    /// backward. Maps output name to the aliased input name.
    pub(crate) inplace_grad_name_map: HashMap<String, String>,
}

impl GradNode {
    pub fn new() -> Self {
        GradNode::default()
    }

    /// Wraps the node into the shared handle form the recorder keeps.
    pub fn into_ref(self) -> GradNodeRef {
        Arc::new(RwLock::new(self))
    }

    pub fn add_op(&mut self, op: GradOp) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[GradOp] {
        &self.ops
    }

    pub fn add_grad_pending_node(&mut self, node: WeakGradNode) {
        self.grad_pending_nodes.push(node);
    }

    pub fn grad_pending_nodes(&self) -> &[WeakGradNode] {
        &self.grad_pending_nodes
    }

    pub fn set_inplace_grad_name_map(&mut self, map: HashMap<String, String>) {
        self.inplace_grad_name_map = map;
    }

    pub fn inplace_grad_name_map(&self) -> &HashMap<String, String> {
        &self.inplace_grad_name_map
    }

    /// Whether any op in this node reads `var` through a grad-input slot.
    ///
    /// Used to locate the true consumer of a gradient among pending nodes:
    /// an in-place forward op can re-route a variable's canonical producer,
    /// so the pending node that actually reads the variable is authoritative.
    pub fn reads_grad_var(&self, var: &Variable) -> bool {
        for op in &self.ops {
            for slot in op.ins().values() {
                if !slot.is_grad {
                    continue;
                }
                if slot.vars.iter().any(|v| v.ptr_eq(var)) {
                    return true;
                }
            }
        }
        false
    }
}
