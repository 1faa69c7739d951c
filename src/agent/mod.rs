//! Agent layer: one symbolic agent and its decision cycle.
//!
//! The [`Agent`] owns working memory, the match network, preference memory
//! and the goal stack. Its decision cycle runs in phases:
//! - **Input**: deliver finished background retrievals
//! - **Elaborate**: fire and retract rule matches in waves until quiescence
//! - **Decide**: select operators or create and remove impasse subgoals
//! - **Output**: report changes under the output link

pub mod agent;
pub mod cycle;
pub mod goal;
pub mod rhs;

pub use agent::{Agent, AgentStats, GoalView, Instantiation, PrefId, RunSummary, RunUnit};
pub use goal::Phase;
