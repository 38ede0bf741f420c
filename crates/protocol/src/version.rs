//! Host message protocol version

/// Version of the host message protocol.
///
/// Every request carries a `version` field that is compared against this
/// constant by the server. The only request exempt from the check is
/// `stop-server`, so that a mismatching client can still stop a running
/// server.
pub const HOST_MESSAGE_VERSION: u64 = 1;
