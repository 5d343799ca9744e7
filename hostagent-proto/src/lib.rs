//! Wire-level protocol shared between the host agent daemon and its
//! control-plane client.
//!
//! Covers the three layers every request passes through: chunked framing
//! over a byte-stream channel, the replay-protected symmetric envelope,
//! and response-envelope normalization.

pub mod envelope;
pub mod frame;
pub mod response;

/// Control-channel value that ends the dispatch loop.
pub const SENTINEL_DONE: &str = "done";

/// Unencrypted fast-path commands carried on a task channel.
pub const SHORTCUT_HEALTHCHECK: &str = "healthcheck";
pub const SHORTCUT_STATUSCHECK: &str = "statuscheck";
pub const SHORTCUT_VERSIONCHECK: &str = "versioncheck";
