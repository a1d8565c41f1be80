use super::*;
use crate::autograd::kernel::GradKernel;
use crate::autograd::node::{AttrValue, SlotList};
use crate::device::DeviceContext;
use crate::types::DType;
use approx::assert_relative_eq;
use std::sync::Arc;

/// Keeps recorded nodes alive for the duration of a test, standing in for
/// the forward recorder that owns the reverse graph.
struct Tape {
    nodes: Vec<GradNodeRef>,
    next_op_id: u64,
}

impl Tape {
    fn new() -> Self {
        Tape {
            nodes: Vec::new(),
            next_op_id: 0,
        }
    }

    fn next_op_id(&mut self) -> u64 {
        let id = self.next_op_id;
        self.next_op_id += 1;
        id
    }

    fn record(&mut self, node: GradNode) -> GradNodeRef {
        let node_ref = node.into_ref();
        self.nodes.push(node_ref.clone());
        node_ref
    }
}

/// Copies the incoming gradient into every grad-output slot.
#[derive(Debug)]
struct GradCopyKernel;

impl GradKernel for GradCopyKernel {
    fn run(
        &self,
        _ctx: &DeviceContext,
        ins: &SlotMap,
        outs: &SlotMap,
        _attrs: &std::collections::HashMap<String, AttrValue>,
    ) -> Result<(), AutogradError> {
        let src = ins["Out@GRAD"].vars[0]
            .value()
            .ok_or_else(|| AutogradError::Internal("missing incoming gradient".to_string()))?;
        for slot in outs.values().filter(|slot| slot.is_grad) {
            for var in &slot.vars {
                var.set_value(src.clone());
            }
        }
        Ok(())
    }
}

/// Scales the incoming gradient by the `scale` attribute.
#[derive(Debug)]
struct GradScaleKernel;

impl GradKernel for GradScaleKernel {
    fn run(
        &self,
        _ctx: &DeviceContext,
        ins: &SlotMap,
        outs: &SlotMap,
        attrs: &std::collections::HashMap<String, AttrValue>,
    ) -> Result<(), AutogradError> {
        let scale = attrs["scale"]
            .as_f64()
            .ok_or_else(|| AutogradError::Internal("scale attr must be f64".to_string()))? as f32;
        let src = ins["Out@GRAD"].vars[0]
            .value()
            .ok_or_else(|| AutogradError::Internal("missing incoming gradient".to_string()))?;
        let data: Vec<f32> = src.to_f32_vec()?.iter().map(|v| v * scale).collect();
        let out = TensorData::from_f32(data, src.shape.clone())?;
        for slot in outs.values().filter(|slot| slot.is_grad) {
            for var in &slot.vars {
                var.set_value(out.clone());
            }
        }
        Ok(())
    }
}

fn seed_var(name: &str, data: Vec<f32>, shape: Vec<usize>, grad: &Variable) -> Variable {
    let var = Variable::new(name, DType::F32, shape.clone());
    var.set_value(TensorData::from_f32(data, shape).expect("seed tensor"));
    var.set_grad_var(grad.clone());
    var
}

/// Records `z = x + y; y = 2x` and returns (tape, z, x_grad, scale_node).
///
/// Reverse graph: add_grad writes x@GRAD (leaf) and y@GRAD, scale_grad
/// consumes y@GRAD and writes x@GRAD again, so the leaf bucket expects two
/// contributions.
fn record_fan_in() -> (Tape, Variable, Variable, GradNodeRef) {
    let mut tape = Tape::new();

    let x_grad = Variable::new_grad("x@GRAD", DType::F32, vec![1]);
    let y_grad = Variable::new_grad("y@GRAD", DType::F32, vec![1]);
    let z_grad = Variable::new_grad("z@GRAD", DType::F32, vec![1]);

    let scale_id = tape.next_op_id();
    let mut scale_node = GradNode::new();
    let mut scale_op = GradOp::new("scale_grad", scale_id, Arc::new(GradScaleKernel));
    scale_op.add_input("Out@GRAD", SlotList::grad(vec![y_grad.clone()]));
    scale_op.add_output("X@GRAD", SlotList::grad(vec![x_grad.clone()]));
    scale_op.set_attr("scale", AttrValue::F64(2.0));
    scale_node.add_op(scale_op);
    let scale_node = tape.record(scale_node);
    y_grad.set_producer_node(Arc::downgrade(&scale_node));

    let add_id = tape.next_op_id();
    let mut add_node = GradNode::new();
    let mut add_op = GradOp::new("add_grad", add_id, Arc::new(GradCopyKernel));
    add_op.add_input("Out@GRAD", SlotList::grad(vec![z_grad.clone()]));
    add_op.add_output("X@GRAD", SlotList::grad(vec![x_grad.clone()]));
    add_op.add_output("Y@GRAD", SlotList::grad(vec![y_grad.clone()]));
    add_node.add_op(add_op);
    add_node.add_grad_pending_node(Arc::downgrade(&scale_node));
    let add_node = tape.record(add_node);
    z_grad.set_producer_node(Arc::downgrade(&add_node));

    let z = seed_var("z", vec![5.0], vec![1], &z_grad);
    (tape, z, x_grad, scale_node)
}

#[test]
fn test_execute_without_init_is_noop() {
    let mut engine = Engine::new();
    assert_eq!(engine.execute(), Ok(()));
}

#[test]
fn test_init_stop_gradient_seed_skips() {
    let (_tape, z, _x_grad, _scale_node) = record_fan_in();
    z.set_stop_gradient(true);
    let mut engine = Engine::new();
    engine.init(&z, false).unwrap();
    assert!(engine.init_node.is_none());
    assert_eq!(engine.execute(), Ok(()));
}

#[test]
fn test_init_twice_without_retention_fails() {
    let (_tape, z, _x_grad, _scale_node) = record_fan_in();
    let mut engine = Engine::new();
    engine.init(&z, false).unwrap();
    engine.execute().unwrap();

    let mut second = Engine::new();
    let result = second.init(&z, false);
    assert!(matches!(result, Err(AutogradError::AlreadyConsumed { .. })));
}

#[test]
fn test_init_missing_primal_value() {
    let (_tape, z, _x_grad, _scale_node) = record_fan_in();
    z.take_value();
    let mut engine = Engine::new();
    let result = engine.init(&z, false);
    assert!(matches!(result, Err(AutogradError::MissingGradSlot { .. })));
}

#[test]
fn test_prepare_deps_counts_edges_and_references() {
    let (_tape, z, x_grad, scale_node) = record_fan_in();
    let mut engine = Engine::new();
    engine.init(&z, true).unwrap();
    engine.prepare_deps().unwrap();

    // One reverse edge into the scale node, two write-sites on the leaf.
    assert_eq!(engine.node_deps.get(&node_id(&scale_node)), Some(&1));
    assert_eq!(engine.leaf_accumulator_ref_cnt(&x_grad), Some(2));
}

#[test]
fn test_prepare_deps_twice_fails() {
    let (_tape, z, _x_grad, _scale_node) = record_fan_in();
    let mut engine = Engine::new();
    engine.init(&z, true).unwrap();
    engine.prepare_deps().unwrap();
    let result = engine.prepare_deps();
    assert!(matches!(
        result,
        Err(AutogradError::AlreadyInitialized { .. })
    ));
}

#[test]
fn test_ref_count_soundness_after_drive() {
    let (_tape, z, x_grad, _scale_node) = record_fan_in();
    let mut engine = Engine::new();
    engine.init(&z, true).unwrap();
    engine.drive().unwrap();

    // Both write-sites went through sum_grad: contributions == ref_cnt.
    let acc = engine.leaf_accumulators.get(&x_grad.id()).unwrap();
    assert_eq!(acc.cur_cnt(), acc.ref_cnt());
    assert_eq!(acc.cur_cnt(), 2);

    let grad = x_grad.value().unwrap().to_f32_vec().unwrap();
    assert_relative_eq!(grad[0], 3.0);
}

#[test]
fn test_hook_on_non_leaf_rejected() {
    #[derive(Debug)]
    struct NoopHook;
    impl crate::variable::BackwardHook for NoopHook {
        fn on_grad_ready(&self, _grad: &Variable) {}
    }

    let (_tape, z, _x_grad, scale_node) = record_fan_in();
    // y@GRAD has a producer node; hooking it is illegal.
    let y_grad = scale_node.read().unwrap().ops()[0].ins()["Out@GRAD"].vars[0].clone();
    y_grad.add_leaf_hook(Arc::new(NoopHook));

    let mut engine = Engine::new();
    engine.init(&z, true).unwrap();
    let result = engine.prepare_deps();
    assert!(matches!(result, Err(AutogradError::HookOnNonLeaf { .. })));
}

#[test]
fn test_dropped_pending_node_is_reported() {
    let mut tape = Tape::new();

    let x_grad = Variable::new_grad("x@GRAD", DType::F32, vec![1]);
    let z_grad = Variable::new_grad("z@GRAD", DType::F32, vec![1]);

    let dead = GradNode::new().into_ref();
    let dead_weak = Arc::downgrade(&dead);
    drop(dead);

    let op_id = tape.next_op_id();
    let mut node = GradNode::new();
    let mut op = GradOp::new("copy_grad", op_id, Arc::new(GradCopyKernel));
    op.add_input("Out@GRAD", SlotList::grad(vec![z_grad.clone()]));
    op.add_output("X@GRAD", SlotList::grad(vec![x_grad.clone()]));
    node.add_op(op);
    node.add_grad_pending_node(dead_weak);
    let node = tape.record(node);
    z_grad.set_producer_node(Arc::downgrade(&node));

    let z = seed_var("z", vec![1.0], vec![1], &z_grad);
    let mut engine = Engine::new();
    engine.init(&z, false).unwrap();
    let result = engine.execute();
    assert!(matches!(result, Err(AutogradError::MissingNode { .. })));
}

#[test]
fn test_failed_execute_clears_engine_state() {
    let (_tape, z, _x_grad, _scale_node) = record_fan_in();
    let mut engine = Engine::new();
    engine.init(&z, false).unwrap();
    // Mutate the seed gradient in place after recording so the very first
    // op fails its version check.
    z.grad_var().unwrap().bump_inplace_version().unwrap();
    let result = engine.execute();
    assert!(matches!(
        result,
        Err(AutogradError::InplaceTampering { .. })
    ));
    assert!(engine.init_node.is_none());
    assert!(engine.node_deps.is_empty());
    assert!(engine.leaf_accumulators.is_empty());
}
