//! Per-variable gradient accumulation.
//!
//! Every gradient bucket discovered during dependency analysis gets one
//! [`GradientAccumulator`]. The accumulator knows how many contributions to
//! expect (`ref_cnt`, fixed by the analyzer), receives partial gradients as
//! ops execute, and finalizes the bucket once all contributions arrived:
//! folding sorted contributions, merging with a gradient retained from an
//! earlier backward pass, and firing leaf post-hooks.

use crate::error::AutogradError;
use crate::math;
use crate::tensor_data::TensorData;
use crate::variable::{BackwardHook, Variable};
use std::sync::Arc;

/// How partial gradients are combined.
///
/// Tensor addition is floating-point and non-associative, so the eager
/// strategy's result depends on arrival order. The sorted strategy defers
/// all additions and folds by ascending op id, which is stable across runs
/// that see the same contributions.
#[derive(Debug)]
enum SumStrategy {
    /// One running sum, updated in place on each contribution.
    Eager,
    /// Contributions buffered with their op ids, folded at completion.
    Sorted { parts: Vec<(TensorData, u64)> },
}

/// Sink that sums all partial gradients routed to one variable.
#[derive(Debug)]
pub struct GradientAccumulator {
    /// The canonical gradient bucket.
    var: Variable,
    /// When `var` already holds a gradient from a prior retained backward,
    /// this pass's sum is collected here and merged in `accumulate_grad`.
    inner_var: Option<Variable>,
    /// Expected number of contributions. Incremented only by dependency
    /// analysis, never during execution.
    ref_cnt: usize,
    /// Contributions received so far.
    cur_cnt: usize,
    strategy: SumStrategy,
    post_hooks: Vec<Arc<dyn BackwardHook>>,
}

impl GradientAccumulator {
    /// Builds an accumulator for `var`. The strategy is fixed here, sampled
    /// from configuration by the caller.
    pub fn new(var: Variable, sorted: bool) -> Self {
        let inner_var = if var.has_value() {
            let inner = var.temp_like();
            log::debug!(
                "gradient of {} holds a retained value, accumulating this pass into an inner variable",
                var.name()
            );
            Some(inner)
        } else {
            None
        };
        let strategy = if sorted {
            SumStrategy::Sorted { parts: Vec::new() }
        } else {
            SumStrategy::Eager
        };
        GradientAccumulator {
            var,
            inner_var,
            ref_cnt: 0,
            cur_cnt: 0,
            strategy,
            post_hooks: Vec::new(),
        }
    }

    pub fn var(&self) -> &Variable {
        &self.var
    }

    pub fn has_inner_var(&self) -> bool {
        self.inner_var.is_some()
    }

    /// The inner bucket this pass writes into, when one exists.
    pub fn inner_var(&self) -> Option<Variable> {
        self.inner_var.clone()
    }

    pub fn increase_ref_cnt(&mut self) {
        self.ref_cnt += 1;
    }

    pub fn ref_cnt(&self) -> usize {
        self.ref_cnt
    }

    pub fn cur_cnt(&self) -> usize {
        self.cur_cnt
    }

    /// Records one partial gradient produced under `op_id`.
    ///
    /// Contributions for a stop-gradient bucket are counted but dropped, so
    /// the bucket stays untouched while completion tracking still works.
    pub fn sum_grad(&mut self, partial: Variable, op_id: u64) -> Result<(), AutogradError> {
        self.cur_cnt += 1;
        if self.var.stop_gradient() {
            log::debug!(
                "variable {} has stop_gradient set, skipping gradient contribution",
                self.var.name()
            );
            return Ok(());
        }
        let Some(tensor) = partial.take_value() else {
            // A branch that produced no signal contributes nothing.
            log::debug!(
                "partial gradient for {} is uninitialized, nothing to sum",
                self.var.name()
            );
            return Ok(());
        };
        if let SumStrategy::Sorted { parts } = &mut self.strategy {
            parts.push((tensor, op_id));
            return Ok(());
        }
        self.add_into_target(tensor)
    }

    /// Whether all expected contributions have been applied.
    ///
    /// `ref_cnt == 1` counts as completed even with no `sum_grad` call: a
    /// single unshared write goes directly into the bucket's storage during
    /// op execution and never passes through `sum_grad`.
    pub fn sum_completed(&self) -> bool {
        self.cur_cnt == self.ref_cnt || self.ref_cnt == 1
    }

    /// Finalizes the bucket after the last contribution.
    ///
    /// In sorted mode this performs the deferred fold, stable-sorted by
    /// ascending op id. Afterwards any inner sum is merged into the target
    /// variable: added on top of a retained gradient, or installed as-is.
    pub fn accumulate_grad(&mut self) -> Result<(), AutogradError> {
        let mut parts = match &mut self.strategy {
            SumStrategy::Sorted { parts } => std::mem::take(parts),
            SumStrategy::Eager => Vec::new(),
        };
        parts.sort_by_key(|(_, op_id)| *op_id);
        for (tensor, _) in parts {
            self.add_into_target(tensor)?;
        }
        if let Some(inner) = self.inner_var.take() {
            if let Some(inner_tensor) = inner.take_value() {
                self.var.modify_value(|slot| match slot {
                    Some(existing) => math::add_assign(existing, &inner_tensor),
                    None => {
                        *slot = Some(inner_tensor);
                        Ok(())
                    }
                })?;
            }
        }
        Ok(())
    }

    fn add_into_target(&self, tensor: TensorData) -> Result<(), AutogradError> {
        let target = self.inner_var.as_ref().unwrap_or(&self.var);
        target.modify_value(|slot| match slot {
            // First contribution adopts the partial as the running sum.
            None => {
                *slot = Some(tensor);
                Ok(())
            }
            Some(existing) => math::add_assign(existing, &tensor),
        })
    }

    pub fn set_post_hooks(&mut self, hooks: Vec<Arc<dyn BackwardHook>>) {
        self.post_hooks = hooks;
    }

    pub fn has_post_hooks(&self) -> bool {
        !self.post_hooks.is_empty()
    }

    /// Fires the leaf hooks with the finished gradient variable.
    pub fn call_backward_post_hooks(&self) {
        for hook in &self.post_hooks {
            hook.on_grad_ready(&self.var);
        }
    }
}

#[cfg(test)]
#[path = "accumulator_test.rs"]
mod tests;
