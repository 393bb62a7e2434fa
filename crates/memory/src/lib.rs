//! Memory bridge: composes per-stage context prompts from the objective,
//! external inputs, and prior stage outputs read back from the
//! collaboration form.
//!
//! The bridge is a pure composer; it never writes to the document.

mod bridge;
mod context;

pub use bridge::{ContextSection, MemoryBridge};
pub use context::{
    create_stage1_context, create_stage2a_context, create_stage2b_context, create_stage3_context,
    create_stage4_context, create_watcher_audit_context, load_stage_output,
};
