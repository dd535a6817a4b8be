/// Tunable engine policy. `Default` gives the reference values.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// One-time prekeys generated at registration and topped up by
    /// [`crate::session::SessionEngine::maintain`].
    pub prekey_pool_size: usize,
    /// Skipped-message-key window per session.
    pub max_skip: u32,
    /// Consecutive authentication failures before a session is invalidated.
    pub auth_failure_threshold: u32,
    /// Age in seconds after which the signed prekey is rotated.
    pub signed_prekey_rotation_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prekey_pool_size: murmur_crypto::prekeys::DEFAULT_POOL_SIZE,
            max_skip: murmur_crypto::ratchet::DEFAULT_MAX_SKIP,
            auth_failure_threshold: 3,
            // one week
            signed_prekey_rotation_secs: 7 * 24 * 60 * 60,
        }
    }
}
