//! Step dispatch for pipegraph.
//!
//! Turns the steps of a validated build type into executor invocations and
//! runs them one after another.

pub mod command;
pub mod dispatch;

pub use command::{CommandCatalog, CommandTemplate};
pub use dispatch::{DispatchEvent, DispatchResult, StepDispatcher, StepState};
