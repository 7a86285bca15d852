//! Turn-taking: the controller state machine and its supporting pieces.

pub mod cache;
pub mod cascade;
pub mod controller;
pub mod transcript;

pub use controller::{ControllerDeps, TurnController};
