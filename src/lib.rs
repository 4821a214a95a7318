//! vertica-k8s: core of a Kubernetes operator for Vertica databases
//!
//! This crate collects per-pod facts about a VerticaDB's pods, locates the
//! Kubernetes objects that make up its subclusters and edits the
//! admintools.conf cluster-membership file.

pub mod controller;
pub mod crd;
pub mod error;

pub use crate::error::{Error, Result};
