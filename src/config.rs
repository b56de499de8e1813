//! Operator command line and environment configuration

use std::net::SocketAddr;

use clap::{Parser, ValueEnum};

use crate::controller::RetryPolicy;
use crate::crd::DEFAULT_UTILS_IMAGE;
use crate::error::{Error, Result};

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "gpu-device-operator",
    about = "Reconciles DeviceConfig resources: VFIO node binding and workload status",
    version
)]
pub struct OperatorArgs {
    #[arg(
        long,
        env = "METRICS_ADDR",
        default_value = "0.0.0.0:8080",
        help = "Listen address of the /health and /metrics endpoints"
    )]
    pub metrics_addr: String,

    #[arg(
        long,
        env = "UTILS_IMAGE",
        default_value = DEFAULT_UTILS_IMAGE,
        help = "Worker image used when a DeviceConfig does not set commonConfig.utilsContainer.image"
    )]
    pub utils_image: String,

    #[arg(
        long,
        env = "CONFLICT_RETRIES",
        default_value_t = 5,
        help = "Write attempts per update before giving up on resourceVersion conflicts"
    )]
    pub conflict_retries: u32,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl OperatorArgs {
    /// Parsed listen address
    pub fn metrics_socket(&self) -> Result<SocketAddr> {
        self.metrics_addr.parse().map_err(|e| {
            Error::ConfigError(format!("invalid metrics address {:?}: {}", self.metrics_addr, e))
        })
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        if self.conflict_retries == 0 {
            return Err(Error::ConfigError(
                "conflict retries must be at least 1".to_string(),
            ));
        }
        Ok(RetryPolicy::with_attempts(self.conflict_retries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = OperatorArgs::try_parse_from(["gpu-device-operator"]).unwrap();
        assert_eq!(args.metrics_socket().unwrap().port(), 8080);
        assert_eq!(args.utils_image, DEFAULT_UTILS_IMAGE);
        assert_eq!(args.retry_policy().unwrap().attempts, 5);
        assert_eq!(args.log_format, LogFormat::Text);
    }

    #[test]
    fn test_flags() {
        let args = OperatorArgs::try_parse_from([
            "gpu-device-operator",
            "--metrics-addr",
            "127.0.0.1:9100",
            "--conflict-retries",
            "2",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(args.metrics_socket().unwrap().port(), 9100);
        assert_eq!(args.retry_policy().unwrap().attempts, 2);
        assert_eq!(args.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let args = OperatorArgs::try_parse_from([
            "gpu-device-operator",
            "--metrics-addr",
            "not-an-addr",
            "--conflict-retries",
            "0",
        ])
        .unwrap();
        assert!(args.metrics_socket().is_err());
        assert!(args.retry_policy().is_err());
    }
}
