//! Test utilities for the load driver.
//!
//! This crate provides scripted collaborators for the execution engine: a [`ScriptedClient`]
//! standing in for the system under test, a [`MemoryStore`] collecting samples, and a harness to
//! run task trees without a coordinator. See the modules for all available utilities.
//!
//! [`ScriptedClient`]: client::ScriptedClient
//! [`MemoryStore`]: store::MemoryStore

pub mod client;
pub mod harness;
pub mod store;
pub mod tracing;
