#![allow(clippy::module_inception)] // Allow module name = struct name

// Declare the modules within the autograd directory
pub mod accumulator;
pub mod engine;
pub mod kernel;
pub mod node;

// Re-export the core engine surface for easier access
pub use accumulator::GradientAccumulator;
pub use engine::Engine;
pub use kernel::GradKernel;
pub use node::{AttrValue, GradNode, GradNodeRef, GradOp, NodeId, SlotList, SlotMap, WeakGradNode};
