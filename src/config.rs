//! Connection-wide configuration.
//!
//! A plain struct with a `Default` impl, matching the teacher's
//! `MirrorArgs` convention in `transport.rs` rather than reaching for a
//! config-file crate the teacher itself never depends on.

use std::time::Duration;

/// Tunables for a [`crate::connection::Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Frames with a `Content-Length` larger than this are rejected
    /// before the body is allocated. Default: 100 MiB.
    pub max_content_length: usize,
    /// The timeout applied to `send_request` calls that don't specify
    /// their own. `None` means "wait forever" unless the caller passes
    /// an explicit timeout.
    pub request_timeout_default: Option<Duration>,
    /// When `true`, a handler panic's message is included in the
    /// `InternalError` response sent to the peer. Default `false`: do
    /// not leak internal details to an untrusted peer.
    pub include_exception_details_in_errors: bool,
}

/// The default maximum frame body size: 100 MiB.
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 100 * 1024 * 1024;

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            request_timeout_default: None,
            include_exception_details_in_errors: false,
        }
    }
}
