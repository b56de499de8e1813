//! GPU device operator
//!
//! Reconciles `DeviceConfig` resources: binds GPU functions to vfio-pci on
//! selected nodes through short-lived worker pods and mirrors the counters of
//! the managed DaemonSets into the DeviceConfig status.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod rest_api;

pub use error::{Error, Result};
