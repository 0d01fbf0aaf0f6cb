//! Kubernetes client for kubepanel
//!
//! This crate provides kubeconfig context handling and the pod log source
//! backing each log panel.

mod client;
mod source;

pub use client::KubeClient;
pub use source::KubeLogSource;

// Re-export types that are used in our public API
pub use kubepanel_types::{ContainerSelector, StreamOptions, StreamTarget};
