//! Custom Resource Definitions for the GPU device operator
//!
//! This module defines the DeviceConfig CRD the operator reconciles.

mod device_config;
mod types;


pub use device_config::{DeviceConfig, DeviceConfigSpec, DeviceConfigStatus};
pub use types::*;
