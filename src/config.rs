//! Runtime configuration.
//!
//! [`Config`] holds the tunables shared by all streams in a process: the size
//! of the shared parallel scheduler, the default prefetch of asynchronous
//! operators and the default wall-clock bound of test verifications.
//!
//! The process-wide instance is read once from the environment, see
//! [`Config::from_env`], and is available through [`global`].
//!
//! # Example
//! ```
//! use rivulet::Config;
//!
//! let mut cfg = Config::default();
//! cfg.prefetch = 64;
//! assert_eq!(cfg.prefetch, 64);
//! assert!(cfg.parallelism >= 1);
//! ```

use std::env;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use lazy_static::lazy_static;

lazy_static! {
    static ref GLOBAL: Config = Config::from_env();
}

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of threads backing `Schedulers::parallel()`.
    pub parallelism: usize,
    /// Items requested ahead from each inner source by merging operators.
    pub prefetch: usize,
    /// Queue size of `publish_on` and similar hand-off operators.
    pub buffer_size: usize,
    /// Default wall-clock bound used by `StepVerifier::verify`.
    pub verify_timeout: Duration,
    /// Prefix of the names of scheduler threads.
    pub thread_name_prefix: String,
}

impl Default for Config {
    /// Provides a default configuration:
    /// - `parallelism` = available CPU parallelism
    /// - `prefetch = 32`
    /// - `buffer_size = 256`
    /// - `verify_timeout = 10s`
    /// - `thread_name_prefix = "rivulet"`
    fn default() -> Self {
        Self {
            parallelism: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            prefetch: 32,
            buffer_size: 256,
            verify_timeout: Duration::from_secs(10),
            thread_name_prefix: "rivulet".to_string(),
        }
    }
}

impl Config {
    /// Defaults overridden by `RIVULET_PARALLELISM`, `RIVULET_PREFETCH`,
    /// `RIVULET_BUFFER_SIZE` and `RIVULET_VERIFY_TIMEOUT_MS`.
    ///
    /// Unparsable or zero values are ignored.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();
        if let Some(n) = positive("RIVULET_PARALLELISM") {
            cfg.parallelism = n;
        }
        if let Some(n) = positive("RIVULET_PREFETCH") {
            cfg.prefetch = n;
        }
        if let Some(n) = positive("RIVULET_BUFFER_SIZE") {
            cfg.buffer_size = n;
        }
        if let Some(ms) = positive::<u64>("RIVULET_VERIFY_TIMEOUT_MS") {
            cfg.verify_timeout = Duration::from_millis(ms);
        }
        cfg
    }
}

fn positive<N>(key: &str) -> Option<N>
where
    N: FromStr + PartialOrd + Default,
{
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<N>() {
        Ok(n) if n > N::default() => Some(n),
        _ => {
            tracing::warn!(key, value = %raw, "ignoring invalid configuration value");
            None
        }
    }
}

/// The process-wide configuration.
pub fn global() -> &'static Config {
    &GLOBAL
}
