//! Flow orchestration.
//!
//! This module owns the capture flow state machine and its helpers: the
//! confirmation gate, the sandbox fallback timer and the result assembler. Host
//! layers go through [`create`] and the returned [`FlowInstance`].

mod assembler;
mod controller;
mod gate;
mod host;
mod post_process;
mod sandbox;

pub use host::{create, FlowHandle, FlowInstance};
pub(crate) use post_process::process_flow_completion;
