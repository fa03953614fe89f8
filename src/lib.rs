//! Coordination server and LLM tool-call pipeline for desktop applications
//!
//! Three cooperating subsystems:
//! - [`server`]: a shared TCP registry that lets long-lived applications
//!   expose command endpoints on dynamically assigned loopback ports.
//! - [`supervisor`]: lifecycle management for subprocess tool servers
//!   (start/stop/enable/disable, persisted PIDs, liveness reconciliation).
//! - [`tools`]: extraction of structured tool calls from free-form LLM
//!   output, schema validation, and execution over a child process's stdio.

pub mod client;
pub mod config;
pub mod server;
pub mod supervisor;
pub mod tools;
