//! # Dirsub Worker
//!
//! Adapters that let a [`dirsub_core::worker::WorkerAgent`] run out of process:
//! an HTTP client for the orchestrator's worker protocol and an HTTP
//! automation capability.

pub mod automation;
pub mod client;

pub use automation::HttpAutomation;
pub use client::HttpOrchestratorClient;
