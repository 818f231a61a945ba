//! Configuration for the runtime manager

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// When a checked-out handle builds its session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Initialization {
    /// Load or create the session and attach its listener during checkout
    Eager,

    /// Defer both until the handle's session is first used
    #[default]
    Lazy,
}

/// Runtime manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Serialize checkouts per context. Turn off only when the caller
    /// already guarantees a single user per context.
    #[serde(default = "default_true")]
    pub locking_enabled: bool,

    /// Session construction strategy
    #[serde(default)]
    pub initialization: Initialization,

    /// Upper bound on waiting for a context lock, in milliseconds.
    /// Unset means wait indefinitely.
    #[serde(default)]
    pub lock_timeout_ms: Option<u64>,

    /// Create, warm up and destroy one throwaway session on init
    #[serde(default = "default_true")]
    pub bootstrap_on_init: bool,

    /// Reload and warm up every session with outstanding bindings on init
    #[serde(default = "default_true")]
    pub resume_sessions_on_init: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            locking_enabled: true,
            initialization: Initialization::Lazy,
            lock_timeout_ms: None,
            bootstrap_on_init: true,
            resume_sessions_on_init: true,
        }
    }
}

fn default_true() -> bool {
    true
}

impl ManagerConfig {
    /// Load configuration from defaults, an optional file, then the
    /// environment (`RUNTIME_MANAGER_LOCK_TIMEOUT_MS=500`)
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&ManagerConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // Double underscore keeps field names like lock_timeout_ms intact
        builder = builder.add_source(
            config::Environment::with_prefix("RUNTIME_MANAGER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    pub fn with_locking(mut self, enabled: bool) -> Self {
        self.locking_enabled = enabled;
        self
    }

    pub fn with_initialization(mut self, initialization: Initialization) -> Self {
        self.initialization = initialization;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Skip both init phases; for callers that manage warm-up themselves
    pub fn without_init(mut self) -> Self {
        self.bootstrap_on_init = false;
        self.resume_sessions_on_init = false;
        self
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }
}
