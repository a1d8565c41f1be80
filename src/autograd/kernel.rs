//! The opaque kernel boundary between the engine and the operator library.

use crate::autograd::node::{AttrValue, GradOp, SlotMap};
use crate::device::{device_context_for, DeviceContext};
use crate::error::AutogradError;
use std::collections::HashMap;
use std::fmt::Debug;

/// Executable body of a recorded backward operator.
///
/// Implementations read the tensors of the variables in `ins` and write
/// result tensors into the variables in `outs`. The engine may have rebound
/// output slots to temporaries, so a kernel must always write through the
/// `outs` map it is given, never through captured variables.
///
/// `Debug + Send + Sync` because the `Arc<dyn GradKernel>` holding the
/// kernel is stored in the recorded graph, which may be shared across
/// threads by the owning framework.
pub trait GradKernel: Debug + Send + Sync {
    fn run(
        &self,
        ctx: &DeviceContext,
        ins: &SlotMap,
        outs: &SlotMap,
        attrs: &HashMap<String, AttrValue>,
    ) -> Result<(), AutogradError>;
}

/// Dispatches one backward op against the (possibly remapped) output map.
///
/// Resolves the device context for the op's placement and surfaces kernel
/// errors as `KernelFailure` tagged with the op type. Running an op whose
/// backward trace was already cleared is an engine bug.
pub(crate) fn run_op(op: &GradOp, tmp_outs: &SlotMap) -> Result<(), AutogradError> {
    let ctx = device_context_for(op.place())?;
    let kernel = op.kernel().ok_or_else(|| {
        AutogradError::Internal(format!(
            "backward trace of grad op '{}' was cleared before execution",
            op.op_type()
        ))
    })?;
    log::debug!("start to execute grad op {}", op.op_type());
    kernel
        .run(&ctx, op.ins(), tmp_outs, op.attrs())
        .map_err(|err| AutogradError::KernelFailure {
            op_type: op.op_type().to_string(),
            message: err.to_string(),
        })
}
