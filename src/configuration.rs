//! Config for the league behaviors
//!
//! Configuration can be created programmatically using [`Configuration::new()`] and the `with_*`
//! setters, by reading environment variables using [`Configuration::from_env()`], or from a JSON
//! file using [`Configuration::from_json_file()`].
//!
//! # Environment Variables
//!
//! Every option can be overridden by `LEAGUE_<OPTION>` in upper case, for example
//! `LEAGUE_ROUND_COUNT=7` or `LEAGUE_MOVE_TIMEOUT=500`. Durations are given in milliseconds and
//! flags are enabled by `"true"` (case-insensitive). Unparsable values are ignored with a warning.
//!
//! - `LEAGUE_ROUND_COUNT` — Rounds per match (default: `5`)
//! - `LEAGUE_REPEAT_FACTOR` — Times each pair meets (default: `1`)
//! - `LEAGUE_MOVE_TIMEOUT` — Move deadline (default: `2000`)
//! - `LEAGUE_MISBEHAVIOR_THRESHOLD` — Misbehavior score that flags a competitor (default: `3`)
//! - `LEAGUE_MAX_CONCURRENT_MATCHES` — Supervisor capacity (default: physical CPU count)
//! - `LEAGUE_RETRY_MAX_ATTEMPTS`, `LEAGUE_RETRY_BACKOFF_BASE`, `LEAGUE_RETRY_MAX_BACKOFF`
//! - `LEAGUE_CALL_TIMEOUT` — Per-attempt timeout of non-move calls (default: `5000`)
//! - `LEAGUE_CIRCUIT_BREAKER_FAILURE_THRESHOLD`, `LEAGUE_CIRCUIT_BREAKER_COOLDOWN`,
//!   `LEAGUE_CIRCUIT_BREAKER_WINDOW`
//! - `LEAGUE_TIMING_ANOMALY_WINDOW` (default: `50`)
//! - `LEAGUE_REPORT_RETRY_ROUNDS` (default: `5`)
//! - `LEAGUE_EJECTION_FLAG_LIMIT` — `0` disables ejection (default: `0`)
//! - `LEAGUE_VERIFY_CAPABILITIES` (default: `true`)
//! - `LEAGUE_GAME` (default: `rock_paper_scissors`)
//! - `LEAGUE_VERBOSE` (default: `true`), `LEAGUE_LOG` (default: `false`)

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use tracing::warn;

/// Configuration shared by the orchestrator, supervisors and competitors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub(crate) round_count: u32,
    pub(crate) repeat_factor: u32,
    pub(crate) move_timeout: Duration,
    pub(crate) misbehavior_threshold: u32,
    pub(crate) max_concurrent_matches: usize,
    pub(crate) retry_max_attempts: u32,
    pub(crate) retry_backoff_base: Duration,
    pub(crate) retry_max_backoff: Duration,
    pub(crate) call_timeout: Duration,
    pub(crate) circuit_breaker_failure_threshold: u32,
    pub(crate) circuit_breaker_cooldown: Duration,
    pub(crate) circuit_breaker_window: Duration,
    pub(crate) timing_anomaly_window: Duration,
    pub(crate) report_retry_rounds: u32,
    pub(crate) ejection_flag_limit: u32,
    pub(crate) verify_capabilities: bool,
    pub(crate) game: String,
    pub(crate) verbose: bool,
    pub(crate) log: bool,
}

/// Partial configuration as read from JSON. Missing keys keep their default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    round_count: Option<u32>,
    repeat_factor: Option<u32>,
    move_timeout_ms: Option<u64>,
    misbehavior_threshold: Option<u32>,
    max_concurrent_matches: Option<usize>,
    retry_max_attempts: Option<u32>,
    retry_backoff_base_ms: Option<u64>,
    retry_max_backoff_ms: Option<u64>,
    call_timeout_ms: Option<u64>,
    circuit_breaker_failure_threshold: Option<u32>,
    circuit_breaker_cooldown_ms: Option<u64>,
    circuit_breaker_window_ms: Option<u64>,
    timing_anomaly_window_ms: Option<u64>,
    report_retry_rounds: Option<u32>,
    ejection_flag_limit: Option<u32>,
    verify_capabilities: Option<bool>,
    game: Option<String>,
    verbose: Option<bool>,
    log: Option<bool>,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Matches last 5 rounds and every pair meets once.
    /// - Competitors have 2 seconds per move and are flagged at a misbehavior score of 3.
    /// - A supervisor runs as many matches at once as the machine has physical cores.
    /// - Outbound calls are tried 3 times and a peer's circuit opens after 5 failures.
    /// - Flagged competitors are never ejected.
    /// - Supervisors must expose the match methods to register.
    pub fn new() -> Self {
        Self {
            round_count: 5,
            repeat_factor: 1,
            move_timeout: Duration::from_secs(2),
            misbehavior_threshold: 3,
            max_concurrent_matches: num_cpus::get_physical().max(1),
            retry_max_attempts: 3,
            retry_backoff_base: Duration::from_millis(100),
            retry_max_backoff: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
            circuit_breaker_failure_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(30),
            circuit_breaker_window: Duration::from_secs(60),
            timing_anomaly_window: Duration::from_millis(50),
            report_retry_rounds: 5,
            ejection_flag_limit: 0,
            verify_capabilities: true,
            game: "rock_paper_scissors".to_string(),
            verbose: true,
            log: false,
        }
    }

    /// Create configuration from `LEAGUE_*` environment variables over the defaults.
    pub fn from_env() -> Self {
        fn get_env<T: FromStr>(name: &str, default: T) -> T {
            let var = format!("LEAGUE_{}", name.to_ascii_uppercase());
            match std::env::var(&var) {
                Ok(val) => val.trim().parse().unwrap_or_else(|_| {
                    warn!("ignoring unparsable {var}={val}");
                    default
                }),
                Err(_) => default,
            }
        }
        fn get_env_flag(name: &str, default: bool) -> bool {
            match std::env::var(format!("LEAGUE_{}", name.to_ascii_uppercase())) {
                Ok(val) => val.trim().eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }
        fn get_env_ms(name: &str, default: Duration) -> Duration {
            Duration::from_millis(get_env(name, default.as_millis() as u64))
        }

        let d = Self::new();
        Self {
            round_count: get_env("round_count", d.round_count),
            repeat_factor: get_env("repeat_factor", d.repeat_factor),
            move_timeout: get_env_ms("move_timeout", d.move_timeout),
            misbehavior_threshold: get_env("misbehavior_threshold", d.misbehavior_threshold),
            max_concurrent_matches: get_env("max_concurrent_matches", d.max_concurrent_matches),
            retry_max_attempts: get_env("retry_max_attempts", d.retry_max_attempts),
            retry_backoff_base: get_env_ms("retry_backoff_base", d.retry_backoff_base),
            retry_max_backoff: get_env_ms("retry_max_backoff", d.retry_max_backoff),
            call_timeout: get_env_ms("call_timeout", d.call_timeout),
            circuit_breaker_failure_threshold: get_env(
                "circuit_breaker_failure_threshold",
                d.circuit_breaker_failure_threshold,
            ),
            circuit_breaker_cooldown: get_env_ms(
                "circuit_breaker_cooldown",
                d.circuit_breaker_cooldown,
            ),
            circuit_breaker_window: get_env_ms("circuit_breaker_window", d.circuit_breaker_window),
            timing_anomaly_window: get_env_ms("timing_anomaly_window", d.timing_anomaly_window),
            report_retry_rounds: get_env("report_retry_rounds", d.report_retry_rounds),
            ejection_flag_limit: get_env("ejection_flag_limit", d.ejection_flag_limit),
            verify_capabilities: get_env_flag("verify_capabilities", d.verify_capabilities),
            game: get_env("game", d.game),
            verbose: get_env_flag("verbose", d.verbose),
            log: get_env_flag("log", d.log),
        }
    }

    /// Read a JSON object of options over the defaults. Durations use a `_ms` suffix,
    /// e.g. `{"round_count": 3, "move_timeout_ms": 250}`.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read configuration file {}", path.display()))?;
        Self::from_json_str(&text)
            .with_context(|| format!("invalid configuration file {}", path.display()))
    }

    pub fn from_json_str(text: &str) -> anyhow::Result<Self> {
        let file: ConfigFile = serde_json::from_str(text)?;
        let mut c = Self::new();
        let ms = Duration::from_millis;
        if let Some(v) = file.round_count {
            c.round_count = v;
        }
        if let Some(v) = file.repeat_factor {
            c.repeat_factor = v;
        }
        if let Some(v) = file.move_timeout_ms {
            c.move_timeout = ms(v);
        }
        if let Some(v) = file.misbehavior_threshold {
            c.misbehavior_threshold = v;
        }
        if let Some(v) = file.max_concurrent_matches {
            c.max_concurrent_matches = v;
        }
        if let Some(v) = file.retry_max_attempts {
            c.retry_max_attempts = v;
        }
        if let Some(v) = file.retry_backoff_base_ms {
            c.retry_backoff_base = ms(v);
        }
        if let Some(v) = file.retry_max_backoff_ms {
            c.retry_max_backoff = ms(v);
        }
        if let Some(v) = file.call_timeout_ms {
            c.call_timeout = ms(v);
        }
        if let Some(v) = file.circuit_breaker_failure_threshold {
            c.circuit_breaker_failure_threshold = v;
        }
        if let Some(v) = file.circuit_breaker_cooldown_ms {
            c.circuit_breaker_cooldown = ms(v);
        }
        if let Some(v) = file.circuit_breaker_window_ms {
            c.circuit_breaker_window = ms(v);
        }
        if let Some(v) = file.timing_anomaly_window_ms {
            c.timing_anomaly_window = ms(v);
        }
        if let Some(v) = file.report_retry_rounds {
            c.report_retry_rounds = v;
        }
        if let Some(v) = file.ejection_flag_limit {
            c.ejection_flag_limit = v;
        }
        if let Some(v) = file.verify_capabilities {
            c.verify_capabilities = v;
        }
        if let Some(v) = file.game {
            c.game = v;
        }
        if let Some(v) = file.verbose {
            c.verbose = v;
        }
        if let Some(v) = file.log {
            c.log = v;
        }
        c.validate()?;
        Ok(c)
    }

    /// Reject values no league can run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.round_count == 0 {
            bail!("round_count must be at least 1");
        }
        if self.repeat_factor == 0 {
            bail!("repeat_factor must be at least 1");
        }
        if self.misbehavior_threshold == 0 {
            bail!("misbehavior_threshold must be at least 1");
        }
        if self.max_concurrent_matches == 0 {
            bail!("max_concurrent_matches must be at least 1");
        }
        if self.retry_max_attempts == 0 {
            bail!("retry_max_attempts must be at least 1");
        }
        if self.circuit_breaker_failure_threshold == 0 {
            bail!("circuit_breaker_failure_threshold must be at least 1");
        }
        if self.move_timeout.is_zero() || self.call_timeout.is_zero() {
            bail!("timeouts must be positive");
        }
        if self.game.trim().is_empty() {
            bail!("game must name a registered game");
        }
        Ok(())
    }

    pub fn with_round_count(mut self, value: u32) -> Self {
        self.round_count = value;
        self
    }

    /// How many times every pair of competitors meets.
    pub fn with_repeat_factor(mut self, value: u32) -> Self {
        self.repeat_factor = value;
        self
    }

    /// Time a competitor has to answer a move request.
    pub fn with_move_timeout(mut self, value: Duration) -> Self {
        self.move_timeout = value;
        self
    }

    /// Misbehavior score (timeouts + invalid moves + timing anomalies) that flags a competitor.
    pub fn with_misbehavior_threshold(mut self, value: u32) -> Self {
        self.misbehavior_threshold = value;
        self
    }

    pub fn with_max_concurrent_matches(mut self, value: usize) -> Self {
        self.max_concurrent_matches = value;
        self
    }

    /// Total attempts per outbound call, the first one included.
    pub fn with_retry_max_attempts(mut self, value: u32) -> Self {
        self.retry_max_attempts = value;
        self
    }

    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff_base = base;
        self.retry_max_backoff = max;
        self
    }

    pub fn with_call_timeout(mut self, value: Duration) -> Self {
        self.call_timeout = value;
        self
    }

    pub fn with_circuit_breaker(
        mut self,
        failure_threshold: u32,
        window: Duration,
        cooldown: Duration,
    ) -> Self {
        self.circuit_breaker_failure_threshold = failure_threshold;
        self.circuit_breaker_window = window;
        self.circuit_breaker_cooldown = cooldown;
        self
    }

    /// A reply landing this close to the deadline, after the opponent's, is a timing anomaly.
    pub fn with_timing_anomaly_window(mut self, value: Duration) -> Self {
        self.timing_anomaly_window = value;
        self
    }

    pub fn with_report_retry_rounds(mut self, value: u32) -> Self {
        self.report_retry_rounds = value;
        self
    }

    /// Eject a competitor once it has been flagged in this many matches. `0` disables ejection.
    pub fn with_ejection_flag_limit(mut self, value: u32) -> Self {
        self.ejection_flag_limit = value;
        self
    }

    /// Check a supervisor's `list_methods` before accepting its registration.
    pub fn with_verify_capabilities(mut self, value: bool) -> Self {
        self.verify_capabilities = value;
        self
    }

    pub fn with_game(mut self, value: impl Into<String>) -> Self {
        self.game = value.into();
        self
    }

    /// Enable or disable progress output on stdout.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    pub fn round_count(&self) -> u32 {
        self.round_count
    }

    pub fn move_timeout(&self) -> Duration {
        self.move_timeout
    }

    pub fn misbehavior_threshold(&self) -> u32 {
        self.misbehavior_threshold
    }

    pub fn max_concurrent_matches(&self) -> usize {
        self.max_concurrent_matches
    }

    pub fn game(&self) -> &str {
        &self.game
    }

    pub fn log(&self) -> bool {
        self.log
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}
