//! Shared helpers for the backward scenario tests: a minimal recorder tape
//! that owns the reverse graph, plus the backward kernels the scenarios use.

// Each integration test binary compiles this module separately and uses a
// different subset of it.
#![allow(dead_code)]

use retrograd::autograd::{AttrValue, GradKernel, GradNode, GradNodeRef, SlotList, SlotMap};
use retrograd::device::DeviceContext;
use retrograd::types::DType;
use retrograd::{AutogradError, TensorData, Variable};
use std::collections::HashMap;
use std::sync::Arc;

/// Stands in for the forward tracer: owns the recorded nodes so the weak
/// back handles in variables and pending lists stay alive, and hands out
/// monotonically increasing op ids.
pub struct Tape {
    nodes: Vec<GradNodeRef>,
    next_op_id: u64,
}

#[allow(dead_code)]
impl Tape {
    pub fn new() -> Self {
        Tape {
            nodes: Vec::new(),
            next_op_id: 0,
        }
    }

    pub fn next_op_id(&mut self) -> u64 {
        let id = self.next_op_id;
        self.next_op_id += 1;
        id
    }

    pub fn record(&mut self, node: GradNode) -> GradNodeRef {
        let node_ref = node.into_ref();
        self.nodes.push(node_ref.clone());
        node_ref
    }
}

/// Creates a seed variable holding `data` with its gradient wrapper wired up.
#[allow(dead_code)]
pub fn seed_var(name: &str, data: Vec<f32>, shape: Vec<usize>, grad: &Variable) -> Variable {
    let var = Variable::new(name, DType::F32, shape.clone());
    var.set_value(TensorData::from_f32(data, shape).expect("seed tensor creation failed"));
    var.set_grad_var(grad.clone());
    var
}

/// Creates an `f32` gradient variable of the given shape.
#[allow(dead_code)]
pub fn grad_var(name: &str, shape: Vec<usize>) -> Variable {
    Variable::new_grad(name, DType::F32, shape)
}

fn incoming(ins: &SlotMap, slot: &str) -> Result<TensorData, AutogradError> {
    ins.get(slot)
        .and_then(|slot| slot.vars.first())
        .and_then(|var| var.value())
        .ok_or_else(|| AutogradError::Internal(format!("missing incoming gradient '{}'", slot)))
}

fn write_grad_outputs(outs: &SlotMap, tensor: &TensorData) {
    for slot in outs.values().filter(|slot| slot.is_grad) {
        for var in &slot.vars {
            var.set_value(tensor.clone());
        }
    }
}

/// Copies the incoming gradient into every grad-output slot.
/// Backward of identity-like ops and of `z = x + y` (per-addend copy).
#[derive(Debug)]
pub struct GradCopyKernel;

impl GradKernel for GradCopyKernel {
    fn run(
        &self,
        _ctx: &DeviceContext,
        ins: &SlotMap,
        outs: &SlotMap,
        _attrs: &HashMap<String, AttrValue>,
    ) -> Result<(), AutogradError> {
        let src = incoming(ins, "Out@GRAD")?;
        write_grad_outputs(outs, &src);
        Ok(())
    }
}

/// Scales the incoming gradient by the `scale` attribute.
/// Backward of `y = scale * x`.
#[derive(Debug)]
pub struct GradScaleKernel;

impl GradKernel for GradScaleKernel {
    fn run(
        &self,
        _ctx: &DeviceContext,
        ins: &SlotMap,
        outs: &SlotMap,
        attrs: &HashMap<String, AttrValue>,
    ) -> Result<(), AutogradError> {
        let scale = attrs
            .get("scale")
            .and_then(|attr| attr.as_f64())
            .ok_or_else(|| AutogradError::Internal("scale attr must be f64".to_string()))?
            as f32;
        let src = incoming(ins, "Out@GRAD")?;
        let data: Vec<f32> = src.to_f32_vec()?.iter().map(|v| v * scale).collect();
        let tensor = TensorData::from_f32(data, src.shape.clone())?;
        write_grad_outputs(outs, &tensor);
        Ok(())
    }
}

/// Backward of `y = x * x`: reads the captured forward input from the
/// non-grad slot `X` and emits `2 * x * grad`.
#[derive(Debug)]
pub struct SquareGradKernel;

impl GradKernel for SquareGradKernel {
    fn run(
        &self,
        _ctx: &DeviceContext,
        ins: &SlotMap,
        outs: &SlotMap,
        _attrs: &HashMap<String, AttrValue>,
    ) -> Result<(), AutogradError> {
        let grad = incoming(ins, "Out@GRAD")?;
        let x = incoming(ins, "X")?;
        let data: Vec<f32> = grad
            .to_f32_vec()?
            .iter()
            .zip(x.to_f32_vec()?.iter())
            .map(|(g, x)| 2.0 * x * g)
            .collect();
        let tensor = TensorData::from_f32(data, grad.shape.clone())?;
        write_grad_outputs(outs, &tensor);
        Ok(())
    }
}

/// Adds the gradients of two forward outputs: backward of a two-output op.
#[derive(Debug)]
pub struct TwoOutputGradKernel;

impl GradKernel for TwoOutputGradKernel {
    fn run(
        &self,
        _ctx: &DeviceContext,
        ins: &SlotMap,
        outs: &SlotMap,
        _attrs: &HashMap<String, AttrValue>,
    ) -> Result<(), AutogradError> {
        let first = incoming(ins, "Out0@GRAD")?;
        let second = incoming(ins, "Out1@GRAD")?;
        let data: Vec<f32> = first
            .to_f32_vec()?
            .iter()
            .zip(second.to_f32_vec()?.iter())
            .map(|(a, b)| a + b)
            .collect();
        let tensor = TensorData::from_f32(data, first.shape.clone())?;
        write_grad_outputs(outs, &tensor);
        Ok(())
    }
}

/// Records a single-op node. Inputs and outputs are `(slot_name, variables,
/// is_grad)` triples; `pending` lists the nodes that must run afterwards.
#[allow(dead_code)]
#[allow(clippy::too_many_arguments)]
pub fn record_node(
    tape: &mut Tape,
    op_type: &str,
    kernel: Arc<dyn GradKernel>,
    ins: Vec<(&str, Vec<Variable>, bool)>,
    outs: Vec<(&str, Vec<Variable>, bool)>,
    attrs: Vec<(&str, AttrValue)>,
    pending: Vec<&GradNodeRef>,
    inplace_map: Vec<(&str, &str)>,
) -> GradNodeRef {
    let op_id = tape.next_op_id();
    let mut node = GradNode::new();
    let mut op = retrograd::autograd::GradOp::new(op_type, op_id, kernel);
    for (name, vars, is_grad) in ins {
        let slot = if is_grad {
            SlotList::grad(vars)
        } else {
            SlotList::forward(vars)
        };
        op.add_input(name, slot);
    }
    for (name, vars, is_grad) in outs {
        let slot = if is_grad {
            SlotList::grad(vars)
        } else {
            SlotList::forward(vars)
        };
        op.add_output(name, slot);
    }
    for (name, value) in attrs {
        op.set_attr(name, value);
    }
    node.add_op(op);
    for pending_node in pending {
        node.add_grad_pending_node(Arc::downgrade(pending_node));
    }
    if !inplace_map.is_empty() {
        node.set_inplace_grad_name_map(
            inplace_map
                .into_iter()
                .map(|(out, input)| (out.to_string(), input.to_string()))
                .collect(),
        );
    }
    tape.record(node)
}
