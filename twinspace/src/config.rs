//! Configuration constants and runtime detector settings.

/// Maximum number of workers a single region may fan out to
pub const MAX_WORKERS: usize = 256;

/// Worker count used by [`Forall::default`](crate::Forall)
pub const DEFAULT_WORKERS: usize = 4;

/// Number of independently locked shards in an access log
pub const ACCESS_LOG_SHARDS: usize = 64;

/// Upper bound on conflict reports emitted for one buffer in one region
pub const DEFAULT_MAX_REPORTS_PER_BUFFER: usize = 64;

/// Environment variable read by [`DetectorConfig::from_env`]
pub const RACE_CHECK_ENV: &str = "TWINSPACE_RACE_CHECK";

/// Runtime settings for region race detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorConfig {
    /// Whether capturing an instrumented buffer registers a snapshot at all
    pub enabled: bool,
    /// Reports beyond this count are summarised in a single warning
    pub max_reports_per_buffer: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_reports_per_buffer: DEFAULT_MAX_REPORTS_PER_BUFFER,
        }
    }
}

impl DetectorConfig {
    /// Detection switched off; instrumented accessors behave like the default one.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Reads [`RACE_CHECK_ENV`].
    ///
    /// `0`, `off`, `false` and `no` disable detection. A positive integer keeps
    /// it enabled and sets the per-buffer report cap. Anything else, including
    /// an unset variable, yields the defaults.
    pub fn from_env() -> Self {
        match std::env::var(RACE_CHECK_ENV) {
            Ok(value) => Self::parse(&value),
            Err(_) => Self::default(),
        }
    }

    fn parse(value: &str) -> Self {
        let value = value.trim();
        if matches!(
            value.to_ascii_lowercase().as_str(),
            "0" | "off" | "false" | "no"
        ) {
            return Self::disabled();
        }
        match value.parse::<usize>() {
            Ok(cap) if cap > 0 => Self {
                enabled: true,
                max_reports_per_buffer: cap,
            },
            _ => Self::default(),
        }
    }
}
