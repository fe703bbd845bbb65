//! Server configuration.

use std::time::Duration;

/// Configuration for the sync server and its libraries.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Replicas unseen for longer than this are truant.
    pub truant_cutoff: Duration,
    /// Delay between an accepted write and the rebase it triggers.
    pub rebase_debounce: Duration,
    /// Capacity of each library's command queue.
    pub command_capacity: usize,
    /// Capacity of each library's event channel.
    pub event_capacity: usize,
    /// Whether to require authentication.
    pub require_auth: bool,
    /// Secret key for token validation (if auth enabled).
    pub auth_secret: Option<Vec<u8>>,
    /// Lifetime of issued tokens.
    pub token_expiry: Duration,
}

impl ServerConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            truant_cutoff: Duration::from_secs(30 * 24 * 60 * 60),
            rebase_debounce: Duration::from_secs(2),
            command_capacity: 256,
            event_capacity: 64,
            require_auth: false,
            auth_secret: None,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the truant cutoff.
    pub fn with_truant_cutoff(mut self, cutoff: Duration) -> Self {
        self.truant_cutoff = cutoff;
        self
    }

    /// Sets the rebase debounce delay.
    pub fn with_rebase_debounce(mut self, delay: Duration) -> Self {
        self.rebase_debounce = delay;
        self
    }

    /// Sets the command queue capacity.
    pub fn with_command_capacity(mut self, capacity: usize) -> Self {
        self.command_capacity = capacity.max(1);
        self
    }

    /// Sets the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Sets the token lifetime.
    pub fn with_token_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }

    /// Enables authentication with the given secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.require_auth = true;
        self.auth_secret = Some(secret);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
