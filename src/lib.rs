// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # cogent
//!
//! A symbolic cognitive-architecture engine: production rules matched by a
//! Rete network against a graph-structured working memory, a preference-based
//! decision procedure that selects operators and creates impasse subgoals, and
//! chunking that compiles subgoal results into new rules.
//!
//! ## Architecture
//!
//! - **Symbols** (`symbol`): agent-local interner with copyable handles
//! - **Working memory** (`wme`): timetagged `(id ^attr value)` elements
//! - **Productions** (`production`): the rule language, parser and printer
//! - **Match network** (`rete`): alpha/beta network with negation and NCCs
//! - **Preferences** (`preference`): slot resolution and impasse detection
//! - **Agent** (`agent`): the decision cycle and goal stack
//! - **Chunking** (`chunking`): learning from subgoal results
//! - **Workers** (`worker`): background retrievals from a long-term store
//!
//! ## Library usage
//!
//! ```no_run
//! use cogent::agent::{Agent, RunUnit};
//! use cogent::config::AgentConfig;
//!
//! let mut agent = Agent::new(AgentConfig::default()).unwrap();
//! agent
//!     .load_productions("sp {hello (state <s> ^superstate nil) --> (write |hello|) (halt)}")
//!     .unwrap();
//! let summary = agent.run(10, RunUnit::Decision).unwrap();
//! assert!(summary.halted);
//! ```

pub mod agent;
pub mod chunking;
pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod memory;
pub mod preference;
pub mod production;
pub mod rete;
pub mod symbol;
pub mod wme;
pub mod worker;
