//! Remote workstation lifecycle: power control through the provider API,
//! a cached status snapshot, and a supervised local tunnel to the instance's
//! browser-based remote viewer.
//!
//! [`controller::VmController`] is the entry point. The other modules are its
//! collaborators and can be swapped through the traits they export
//! ([`config::ConfigStore`], [`compute::ComputeApi`],
//! [`credential::TokenSource`], [`tunnel::TunnelLauncher`]).

pub mod compute;
pub mod config;
pub mod controller;
pub mod credential;
pub mod error;
pub mod logging;
pub mod models;
pub mod poller;
pub mod tunnel;

pub use controller::VmController;
pub use error::{AppError, Result};
