//! The backward engine: dependency analysis and topological execution of a
//! recorded reverse graph.
//!
//! The engine is a single-threaded orchestrator. `init` seeds the gradient
//! of the variable backward is called on, `execute` walks the reverse graph
//! in topological order, running each recorded op and routing every partial
//! gradient into its accumulator, and `clear` drops all engine-side state.
//! Callers must serialize `execute` invocations on one engine instance.

use crate::autograd::accumulator::GradientAccumulator;
use crate::autograd::kernel::run_op;
use crate::autograd::node::{node_id, GradNode, GradNodeRef, GradOp, NodeId, SlotMap, WeakGradNode};
use crate::config;
use crate::device::device_context_for;
use crate::error::AutogradError;
use crate::math;
use crate::tensor_data::TensorData;
use crate::variable::{VarId, Variable};
use std::collections::{HashMap, HashSet, VecDeque};

/// Address of an accumulator in the engine's registries.
///
/// Non-leaf sinks are keyed by producer node *and* variable: an in-place op
/// can rebind a variable's producer, so the variable alone is not unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AccumKey {
    Leaf(VarId),
    Node(NodeId, VarId),
}

/// Reverse-mode gradient engine over a recorded backward graph.
#[derive(Default)]
pub struct Engine {
    retain_graph: bool,
    init_node: Option<GradNodeRef>,
    /// Remaining incoming edges per node in the reverse traversal.
    node_deps: HashMap<NodeId, usize>,
    /// Non-leaf gradient sinks, keyed by producer node then variable.
    accumulators: HashMap<NodeId, HashMap<VarId, GradientAccumulator>>,
    /// Leaf gradient sinks.
    leaf_accumulators: HashMap<VarId, GradientAccumulator>,
    /// Temporaries to fold into their accumulator after the current op.
    need_accu_var_list: Vec<(AccumKey, Variable)>,
    /// Inplace output temporaries to move back after the current op.
    inplace_var_list: Vec<(Variable, Variable)>,
    /// Leaf accumulators touched by the current op.
    leaf_accumulators_active: HashSet<VarId>,
    /// Per-engine override of the global sorted-accumulation flag.
    sorted_sum: Option<bool>,
}

impl Engine {
    pub fn new() -> Self {
        Engine::default()
    }

    /// Overrides the process-wide `sort_sum_gradient` flag for accumulators
    /// created by this engine. `None` falls back to the global flag.
    pub fn set_sorted_sum_override(&mut self, sorted: Option<bool>) {
        self.sorted_sum = sorted;
    }

    fn effective_sort_sum(&self) -> bool {
        self.sorted_sum.unwrap_or_else(config::sort_sum_gradient)
    }

    /// Installs the initial backward node and seeds the gradient of `seed`
    /// with ones at the shape and dtype of its primal value.
    pub fn init(&mut self, seed: &Variable, retain_graph: bool) -> Result<(), AutogradError> {
        self.retain_graph = retain_graph;
        let grad_var = seed.grad_var();

        if let Some(grad) = &grad_var {
            if grad.graph_freed() {
                return Err(AutogradError::AlreadyConsumed { var: seed.name() });
            }
        }

        // Capture the producing node before the detach below releases it.
        let producer = grad_var.as_ref().and_then(|grad| grad.producer_node());
        let init_node = match &producer {
            Some(weak) => Some(weak.upgrade().ok_or_else(|| AutogradError::MissingNode {
                context: format!("producer of gradient of '{}'", seed.name()),
            })?),
            None => None,
        };

        if !retain_graph {
            if let Some(grad) = &grad_var {
                log::debug!(
                    "clear the autograd graph from grad var of {} because of retain_graph=false",
                    seed.name()
                );
                grad.set_graph_freed(true);
                grad.detach_producer_node();
            }
        }

        let Some(init_node) = init_node else {
            log::debug!("skip backward: there is no grad op for var {}", seed.name());
            return Ok(());
        };
        if seed.stop_gradient() {
            log::debug!("skip backward: var {} is stop_gradient", seed.name());
            return Ok(());
        }

        let grad_var = grad_var.ok_or_else(|| AutogradError::MissingGradSlot {
            var: seed.name(),
        })?;
        let (shape, dtype, device) =
            seed.primal_shape_and_dtype()
                .ok_or_else(|| AutogradError::MissingGradSlot {
                    var: seed.name(),
                })?;

        log::debug!("init first node of backward");
        // The seed gradient must flow, whatever the recorder marked.
        grad_var.set_stop_gradient(false);
        let ctx = device_context_for(device)?;
        let mut grad_tensor = TensorData::zeros(shape, dtype, device);
        math::set_constant(&ctx, &mut grad_tensor, 1.0)?;
        grad_var.set_value(grad_tensor);

        self.init_node = Some(init_node);
        Ok(())
    }

    /// Breadth-first sweep of the reverse graph: counts incoming edges per
    /// node and provisions one accumulator per gradient write-site.
    pub(crate) fn prepare_deps(&mut self) -> Result<(), AutogradError> {
        if !self.node_deps.is_empty() {
            return Err(AutogradError::AlreadyInitialized {
                registry: "node deps".to_string(),
            });
        }
        if !self.accumulators.is_empty() || !self.leaf_accumulators.is_empty() {
            return Err(AutogradError::AlreadyInitialized {
                registry: "accumulators".to_string(),
            });
        }

        let init = self.init_node.clone().ok_or_else(|| {
            AutogradError::Internal("prepare_deps called without an init node".to_string())
        })?;

        let mut queue: VecDeque<GradNodeRef> = VecDeque::new();
        let mut visited: HashSet<NodeId> = HashSet::new();
        visited.insert(node_id(&init));
        queue.push_back(init);

        while let Some(cur) = queue.pop_front() {
            let node = cur.read().expect("node lock poisoned");

            for op in node.ops() {
                op.enforce_has_in_out()?;
                self.prepare_grad_accumulators(op, node.grad_pending_nodes())?;
            }

            for weak in node.grad_pending_nodes() {
                let pending = weak.upgrade().ok_or_else(|| AutogradError::MissingNode {
                    context: "pending node during dependency analysis".to_string(),
                })?;
                let pid = node_id(&pending);
                *self.node_deps.entry(pid).or_insert(0) += 1;
                if visited.insert(pid) {
                    queue.push_back(pending);
                }
            }
        }
        Ok(())
    }

    /// Provisions accumulators for every grad-output of `op` and bumps
    /// their reference counts.
    fn prepare_grad_accumulators(
        &mut self,
        op: &GradOp,
        pending_nodes: &[WeakGradNode],
    ) -> Result<(), AutogradError> {
        let sorted = self.effective_sort_sum();
        for slot in op.outs().values() {
            if !slot.is_grad {
                continue;
            }
            for var in &slot.vars {
                if var.is_leaf() {
                    let acc = self
                        .leaf_accumulators
                        .entry(var.id())
                        .or_insert_with(|| GradientAccumulator::new(var.clone(), sorted));
                    acc.increase_ref_cnt();
                    log::debug!(
                        "prepare to accumulate leaf variable grad {} with reference count {}",
                        var.name(),
                        acc.ref_cnt()
                    );
                    if var.has_leaf_hooks() {
                        acc.set_post_hooks(var.leaf_hooks());
                    }
                } else {
                    if var.has_leaf_hooks() {
                        return Err(AutogradError::HookOnNonLeaf { var: var.name() });
                    }
                    for weak in pending_nodes {
                        let pending = weak.upgrade().ok_or_else(|| AutogradError::MissingNode {
                            context: "pending node during accumulator provisioning".to_string(),
                        })?;
                        // The pending node that actually reads the variable
                        // is authoritative: an inplace op may have re-routed
                        // the variable's canonical producer. First match wins.
                        if !pending
                            .read()
                            .expect("node lock poisoned")
                            .reads_grad_var(var)
                        {
                            continue;
                        }
                        let pid = node_id(&pending);
                        let acc = self
                            .accumulators
                            .entry(pid)
                            .or_default()
                            .entry(var.id())
                            .or_insert_with(|| GradientAccumulator::new(var.clone(), sorted));
                        acc.increase_ref_cnt();
                        log::debug!(
                            "prepare to accumulate variable grad {} with reference count {}",
                            var.name(),
                            acc.ref_cnt()
                        );
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Drives the traversal to completion. Always leaves the engine cleared,
    /// whether the pass succeeded or failed.
    pub fn execute(&mut self) -> Result<(), AutogradError> {
        if self.init_node.is_none() {
            return Ok(());
        }
        let result = self.drive();
        self.clear();
        result
    }

    fn drive(&mut self) -> Result<(), AutogradError> {
        self.prepare_deps()?;

        let mut queue: VecDeque<GradNodeRef> = VecDeque::new();
        // The init node is moved out of the engine so its handle is dropped
        // as soon as its iteration ends, before successors execute.
        queue.push_back(self.init_node.take().ok_or_else(|| {
            AutogradError::Internal("execute called without an init node".to_string())
        })?);

        let mut op_num = 0usize;

        while let Some(cur_node) = queue.pop_front() {
            let op_len = cur_node.read().expect("node lock poisoned").ops().len();
            for op_idx in 0..op_len {
                op_num += 1;
                self.run_op_at(&cur_node, op_idx)?;
            }

            let pending_nodes: Vec<WeakGradNode> = cur_node
                .read()
                .expect("node lock poisoned")
                .grad_pending_nodes()
                .to_vec();
            for weak in &pending_nodes {
                let pending = weak.upgrade().ok_or_else(|| AutogradError::MissingNode {
                    context: "pending node while collecting ready nodes".to_string(),
                })?;
                let pid = node_id(&pending);
                let Some(dep) = self.node_deps.get_mut(&pid) else {
                    continue;
                };
                *dep -= 1;
                if *dep == 0 {
                    queue.push_back(pending);
                }
            }
        }

        log::debug!("backward op number: {}", op_num);
        Ok(())
    }

    /// Runs one op of `node_ref`: zero-fill of ungenerated inputs, output
    /// remapping, inplace version check, kernel dispatch, and post-run
    /// reconciliation of accumulators, leaf hooks and the backward trace.
    fn run_op_at(&mut self, node_ref: &GradNodeRef, op_idx: usize) -> Result<(), AutogradError> {
        let op_id = {
            let node = node_ref.read().expect("node lock poisoned");
            let op = &node.ops()[op_idx];

            check_backward_inputs(op)?;
            let tmp_outs = self.remap_outputs(&node, op_idx)?;
            check_inplace_versions(op)?;
            run_op(op, &tmp_outs)?;
            op.id()
        };

        // Move inplace temporaries back into the variables they stand for.
        for (orig, tmp) in std::mem::take(&mut self.inplace_var_list) {
            if let Some(tensor) = tmp.take_value() {
                orig.set_value(tensor);
            }
        }

        // Fold temporaries of shared or stop-gradient slots into their sinks.
        for (key, tmp) in std::mem::take(&mut self.need_accu_var_list) {
            let acc = self.accumulator_mut(&key).ok_or_else(|| {
                AutogradError::Internal(
                    "accumulator disappeared during op execution".to_string(),
                )
            })?;
            acc.sum_grad(tmp, op_id)?;
        }

        // Finalize every leaf bucket this op completed and fire its hooks.
        for var_id in std::mem::take(&mut self.leaf_accumulators_active) {
            let Some(acc) = self.leaf_accumulators.get_mut(&var_id) else {
                continue;
            };
            if !acc.sum_completed() {
                continue;
            }
            acc.accumulate_grad()?;
            if acc.has_post_hooks() {
                acc.call_backward_post_hooks();
            }
        }

        if !self.retain_graph {
            let mut node = node_ref.write().expect("node lock poisoned");
            log::debug!(
                "remove backward trace after op {} runs",
                node.ops()[op_idx].op_type()
            );
            node.ops[op_idx].clear_backward_trace();
        }
        Ok(())
    }

    /// Builds the temporary output map for one op.
    ///
    /// Copies the recorded output map and rebinds slots so that graph
    /// integrity survives aliasing: shared or stop-gradient slots get fresh
    /// temporaries summed in afterwards, inplace slots get temporaries moved
    /// back afterwards, and unshared slots write straight into accumulator
    /// storage. Must not be optimized away: several ops can map different
    /// output names onto one variable, and the kernel must never observe
    /// another op's writes mid-flight.
    fn remap_outputs(
        &mut self,
        node: &GradNode,
        op_idx: usize,
    ) -> Result<SlotMap, AutogradError> {
        let op = &node.ops()[op_idx];
        let mut tmp_outs = op.outs().clone();
        let inplace_map = node.inplace_grad_name_map();

        for (name, slot) in tmp_outs.iter_mut() {
            if !slot.is_grad {
                continue;
            }
            for var_slot in slot.vars.iter_mut() {
                let key = self.find_accumulator(node, var_slot)?;
                let (ref_cnt, inner) = {
                    let acc = self.accumulator(&key).ok_or_else(|| {
                        AutogradError::Internal("resolved accumulator vanished".to_string())
                    })?;
                    (acc.ref_cnt(), acc.inner_var())
                };

                if var_slot.is_leaf() {
                    if let AccumKey::Leaf(id) = key {
                        self.leaf_accumulators_active.insert(id);
                    }
                    // Route this pass into the accumulator's owned storage.
                    if let Some(inner) = inner {
                        *var_slot = inner;
                    }
                }

                if var_slot.stop_gradient() || ref_cnt > 1 {
                    let tmp = var_slot.temp_like();
                    log::debug!(
                        "create temporary var of {} for sum gradient within this graph",
                        tmp.name()
                    );
                    self.need_accu_var_list.push((key, tmp.clone()));
                    *var_slot = tmp;
                } else if let Some(in_name) = inplace_map.get(name.as_str()) {
                    if let Some(in_slot) = op.ins().get(in_name) {
                        for in_var in &in_slot.vars {
                            if in_var.ptr_eq(var_slot) {
                                log::debug!("inplace mapping {} -> {}", name, in_name);
                                let tmp = var_slot.temp_like();
                                self.inplace_var_list.push((var_slot.clone(), tmp.clone()));
                                *var_slot = tmp;
                            }
                        }
                    }
                }
            }
        }
        Ok(tmp_outs)
    }

    /// Locates the accumulator a grad-output must feed.
    fn find_accumulator(
        &self,
        node: &GradNode,
        var: &Variable,
    ) -> Result<AccumKey, AutogradError> {
        if var.is_leaf() {
            let id = var.id();
            if self.leaf_accumulators.contains_key(&id) {
                return Ok(AccumKey::Leaf(id));
            }
            return Err(AutogradError::MissingAccumulator { var: var.name() });
        }
        for weak in node.grad_pending_nodes() {
            let pending = weak.upgrade().ok_or_else(|| AutogradError::MissingNode {
                context: format!("pending node while resolving accumulator of '{}'", var.name()),
            })?;
            let pid = node_id(&pending);
            if let Some(per_node) = self.accumulators.get(&pid) {
                if per_node.contains_key(&var.id()) {
                    return Ok(AccumKey::Node(pid, var.id()));
                }
            }
        }
        Err(AutogradError::MissingAccumulator { var: var.name() })
    }

    fn accumulator(&self, key: &AccumKey) -> Option<&GradientAccumulator> {
        match key {
            AccumKey::Leaf(id) => self.leaf_accumulators.get(id),
            AccumKey::Node(node, id) => self.accumulators.get(node)?.get(id),
        }
    }

    fn accumulator_mut(&mut self, key: &AccumKey) -> Option<&mut GradientAccumulator> {
        match key {
            AccumKey::Leaf(id) => self.leaf_accumulators.get_mut(id),
            AccumKey::Node(node, id) => self.accumulators.get_mut(node)?.get_mut(id),
        }
    }

    /// Drops all engine-side references: the init node, dependency counts,
    /// accumulators and per-op scratch lists. External holders of variables
    /// remain valid.
    pub fn clear(&mut self) {
        self.init_node = None;
        self.node_deps.clear();
        self.accumulators.clear();
        self.leaf_accumulators.clear();
        self.need_accu_var_list.clear();
        self.inplace_var_list.clear();
        self.leaf_accumulators_active.clear();
    }

    #[cfg(test)]
    pub(crate) fn leaf_accumulator_ref_cnt(&self, var: &Variable) -> Option<usize> {
        self.leaf_accumulators.get(&var.id()).map(|acc| acc.ref_cnt())
    }
}

/// Materializes zero tensors for grad-inputs a disconnected branch never
/// wrote, at the variable's declared shape and dtype on the op's device.
fn check_backward_inputs(op: &GradOp) -> Result<(), AutogradError> {
    for slot in op.ins().values() {
        if !slot.is_grad {
            continue;
        }
        for var in &slot.vars {
            if var.has_value() {
                continue;
            }
            log::debug!("set ungenerated grad {} as zero", var.name());
            let ctx = device_context_for(op.place())?;
            let mut tensor = TensorData::zeros(var.shape(), var.dtype(), op.place());
            math::set_constant(&ctx, &mut tensor, 0.0)?;
            var.set_value(tensor);
        }
    }
    Ok(())
}

/// Asserts that no input tensor of `op` was mutated in place since it was
/// captured at forward time.
fn check_inplace_versions(op: &GradOp) -> Result<(), AutogradError> {
    for slot in op.ins().values() {
        for var in &slot.vars {
            let observed = var.inplace_version();
            let expected = var.version_snapshot();
            if observed != expected {
                return Err(AutogradError::InplaceTampering {
                    var: var.name(),
                    op_type: op.op_type().to_string(),
                    observed,
                    expected,
                });
            }
            log::trace!("the version of tensor {} is [{}]", var.name(), expected);
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod tests;
