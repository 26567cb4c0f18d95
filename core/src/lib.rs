pub mod application;
pub mod cli;
pub mod config;
pub mod controller;
pub mod creator;
pub mod db;
pub mod errors;
pub mod identity;
pub mod scheduler;
pub mod store;
pub mod template;
pub mod types;
pub mod waiter;

#[cfg(test)]
mod test_helpers;

// Re-export main types
pub use types::*;

pub use application::{initialize, Application, InitBuilder, InitOptions};
pub use controller::{ExtraLink, Outcome, TriggerController, TriggerRequest};
pub use errors::TriggerError;
pub use waiter::{DeferredWait, RunStateEvent, SuspendStrategy, WaitPolicy};
