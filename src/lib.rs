#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unused_self,
    clippy::unnecessary_wraps
)]

use clap::Subcommand;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod daemon;
pub mod dedup;
pub mod delivery;
pub mod dispatch;
pub mod fsm;
pub mod health;
pub mod observability;
pub mod queue;
pub mod retry;
pub mod router;
pub mod throttle;

pub use config::Config;
pub use dispatch::{Dispatcher, ProcessOutcome, SubmitError};

/// Task tracking subcommands
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskCommands {
    /// Show one task with its transition history
    Show {
        /// Task id
        task_id: String,
    },
    /// List all tracked tasks, oldest first
    List,
    /// Feed a recipient activity event to the task state machine
    #[command(long_about = "\
Feed a recipient activity event to the task state machine.

Kinds: ack (acknowledged), done (completed), error (failed), activity.
Activity never moves a task; events for finished tasks are discarded.

Examples:
  courier task event task-42 ack
  courier task event task-42 done --payload 'all checks green'")]
    Event {
        /// Task id
        task_id: String,
        /// Event kind (ack, done, error, activity)
        kind: String,
        /// Optional detail recorded in the task history
        #[arg(long)]
        payload: Option<String>,
    },
}

/// Config subcommands
#[derive(Subcommand, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConfigCommands {
    /// Dump the full configuration JSON Schema to stdout
    Schema,
}
