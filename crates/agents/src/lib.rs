//! Stage agents, the Watcher, and the Stage-4 tool loop.
//!
//! Every agent follows the same invoke contract: compose messages (optional
//! file-loaded system prompt, context as the user message), call the model,
//! collate streamed fragments, return text.  Agents only touch the
//! collaboration form through explicit write-through hooks.

mod base;
mod parser;
mod stage4;
mod stages;
mod upgrade;
mod watcher;

pub use base::{AgentCore, extract_section, load_prompt, prompt_with_library_dir};
pub use parser::{ToolCall, format_tool_result, parse_tool_calls};
pub use stage4::Stage4ExecutorAgent;
pub use stages::{
    CandidateStrategyAgent, ExecutionPlanningAgent, MetacognitiveAnalysisAgent,
    StrategySelectionAgent,
};
pub use upgrade::{CAPABILITY_LIBRARY_FILE, STRATEGY_LIBRARY_FILE, UpgradeAgent};
pub use watcher::WatcherAgent;
