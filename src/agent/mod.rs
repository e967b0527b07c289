//! GUI agent track: task preparation, the action protocol, the step loop
//! and result collection.

pub mod action;
pub mod decoder;
pub mod prepare;
pub mod results;
pub mod session;

use serde::{Deserialize, Serialize};

pub use action::{ActionInput, ActionRecord, parse_actions};
pub use decoder::{AutomationCommand, Decoded, MouseButton, TaskOutcome, decode};
pub use prepare::{PrepareSummary, TaskGroup, prepare_agent_tasks, read_path_list};
pub use results::{
    AgentEvaluation, CostSummary, TerminalCounts, collect_all, collect_candidate_result, evaluate_agent_results,
    total_agent_cost,
};
pub use session::{AgentSession, BrowserDriver, FinalResult, Screenshot, TaskKind, TaskMetadata, Trajectory, run_task};

/// Pixel size of the browser viewport actions are scaled to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}
