//! Skylets: per-cluster supervisors reconciling desired state into
//! concrete cluster-manager actions, and the manager that runs one Skylet
//! per registered cluster.

pub mod controllers;
pub mod manager;
pub mod skylet;

pub use crate::{
    manager::SkyletManager,
    skylet::{run_skylet, SkyletConfig, SkyletError},
};
