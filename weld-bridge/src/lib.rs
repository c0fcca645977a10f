//! weld-bridge — cross-runtime adapters that let a [`weld_core::section::Section`]
//! wrap synchronous or differently-scheduled work: a background thread
//! ([`thread::ThreadBridge`]), a child process ([`process::ProcessBridge`]),
//! or a distinct event loop ([`foreign_loop::ForeignLoopBridge`]).
//!
//! Each bridge is a regular `Section` from weld-core's point of view —
//! the "environment" a stage runs in is a property of which bridge type
//! wraps it, not a separate enum weld itself has to branch on.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod foreign_loop;
pub mod process;
pub mod thread;
