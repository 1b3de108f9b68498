//! Container and process lifecycle management for the wasmshim runtime.
//!
//! A [`factory::ContainerFactory`] turns a create request into a
//! [`container::Container`] holding one init [`process::WasmProcess`].
//! Starting a process runs the [`launcher`] output as an OS process and
//! hands it to a background waiter that records the exit status and
//! publishes exactly one [`wasmshim_common::types::Exit`] event.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod bundle;
pub mod container;
pub mod factory;
pub mod launcher;
pub mod process;
