//! # Session Identifiers
//!
//! Every analysis cycle is correlated end-to-end by a single session id: the
//! same token is sent with the multipart upload and used to open the progress
//! channel, so the backend can route progress events to the right client.
//!
//! ## Lifetime:
//! A session id is generated immediately before any network activity, lives
//! for exactly one upload/analysis cycle, and is never reused. It is a routing
//! key, not a credential, so it does not need to be cryptographically secure —
//! a millisecond timestamp plus a random suffix is more than enough to avoid
//! collisions between concurrent clients.

use chrono::Utc;
use uuid::Uuid;

/// Opaque correlation token binding one upload to one backend job.
///
/// Wrapping the string in a newtype keeps session ids from being mixed up
/// with other strings (file names, error messages) at compile time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh session id of the form `session_{epoch_millis}_{random}`.
    ///
    /// The time prefix keeps ids roughly sortable in backend logs; the random
    /// suffix makes collisions between clients starting in the same
    /// millisecond practically impossible.
    pub fn generate() -> Self {
        let millis = Utc::now().timestamp_millis();
        let suffix: String = Uuid::new_v4().simple().to_string().chars().take(9).collect();
        SessionId(format!("session_{}_{}", millis, suffix))
    }

    /// Borrow the id as a plain string for URLs and form fields.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
