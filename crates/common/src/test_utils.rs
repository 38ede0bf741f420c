//! Test utilities for the QDB debug bridge
//!
//! Provides mock builders and helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::mock_device_information;
//!
//! let device = mock_device_information("A123");
//! assert_eq!(device.serial, "A123");
//! ```

use protocol::DeviceInformation;
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock `DeviceInformation` for testing
///
/// The host MAC and IP address are filled with fixed placeholder values.
pub fn mock_device_information(serial: &str) -> DeviceInformation {
    DeviceInformation {
        serial: serial.to_string(),
        host_mac: "02:00:00:00:00:01".to_string(),
        ip_address: "10.10.10.2".to_string(),
    }
}

/// Panic if `future` does not complete within `timeout`
///
/// Keeps hanging asynchronous tests from stalling the whole suite.
pub async fn with_timeout<F, T>(timeout: Duration, future: F) -> T
where
    F: Future<Output = T>,
{
    tokio::time::timeout(timeout, future)
        .await
        .expect("test timed out")
}
