//! Build executors for Foreman.
//!
//! Provides executor implementations for running builds:
//! - Shell (local nodes): scm checkout followed by the project steps

pub mod scm;
pub mod shell;

pub use foreman_core::executor::{ExecutionContext, Executor};
pub use shell::ShellExecutor;
