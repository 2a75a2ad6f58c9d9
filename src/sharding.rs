//! Deterministic worker sharding.
//!
//! CI clusters split one test matrix across several workers with no
//! coordination at all: every worker hashes every test name the same way and
//! keeps only the names that land on its own index. The hash is a content
//! digest of the name, so the assignment is stable across processes, hosts,
//! and runs — which is exactly what incremental schedulers need to avoid
//! re-shuffling jobs between workers.
//!
//! # Example
//!
//! ```
//! use gridtest::sharding::accept_name;
//!
//! // Exactly one of the three workers accepts each name.
//! let accepted: Vec<u32> = (0..3).filter(|&i| accept_name("check_codec", i, 3)).collect();
//! assert_eq!(accepted.len(), 1);
//! ```

use std::sync::OnceLock;

use sha2::{Digest, Sha256};

/// Environment variable holding this worker's zero-based index.
pub const ENV_WORKER_INDEX: &str = "GRIDTEST_WORKER_INDEX";

/// Environment variable holding the total worker count.
pub const ENV_WORKER_COUNT: &str = "GRIDTEST_WORKER_COUNT";

/// Optional salt mixed into the digest before the test name.
///
/// Changing the salt reshuffles the whole partition without renaming any
/// test, which is the escape hatch for a pathologically unbalanced split.
pub const ENV_SHARD_SALT: &str = "GRIDTEST_SHARD_SALT";

// CircleCI's built-in parallelism variables, honored as a fallback.
const ENV_CIRCLE_INDEX: &str = "CIRCLE_NODE_INDEX";
const ENV_CIRCLE_COUNT: &str = "CIRCLE_NODE_TOTAL";

/// Errors produced while reading the sharding configuration.
///
/// These are configuration errors: a worker that mis-reads its index would
/// silently double-run or drop tests, so parsing never degrades to a default.
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    /// An environment variable did not parse as a non-negative integer.
    #[error("invalid value {value:?} for {var}: expected a non-negative integer")]
    InvalidVar { var: &'static str, value: String },

    /// The worker count was zero.
    #[error("worker count must be at least 1")]
    ZeroWorkers,

    /// The worker index does not fit the worker count.
    #[error("worker index {index} out of range for {count} workers")]
    IndexOutOfRange { index: u32, count: u32 },
}

/// Maps a name to its shard: SHA-256 of salt ++ name, last 4 bytes big-endian.
fn shard_value(name: &str, salt: &[u8]) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let n = digest.len();
    u32::from_be_bytes([digest[n - 4], digest[n - 3], digest[n - 2], digest[n - 1]])
}

/// Returns whether `worker_index` of `worker_count` accepts `name`.
///
/// For a fixed `worker_count` this partitions the universe of names into
/// `worker_count` disjoint buckets: exactly one index accepts any given name.
/// The distribution is uniform in expectation, not exactly balanced.
pub fn accept_name(name: &str, worker_index: u32, worker_count: u32) -> bool {
    accept_name_salted(name, b"", worker_index, worker_count)
}

/// [`accept_name`] with an explicit digest salt.
pub fn accept_name_salted(name: &str, salt: &[u8], worker_index: u32, worker_count: u32) -> bool {
    let count = worker_count.max(1);
    shard_value(name, salt) % count == worker_index
}

/// Sharding configuration for this process: which worker we are, out of how
/// many, and the optional digest salt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardConfig {
    index: u32,
    count: u32,
    salt: Vec<u8>,
}

impl ShardConfig {
    /// Creates a configuration, validating that `index < count`.
    pub fn new(index: u32, count: u32) -> Result<Self, ShardError> {
        if count == 0 {
            return Err(ShardError::ZeroWorkers);
        }
        if index >= count {
            return Err(ShardError::IndexOutOfRange { index, count });
        }
        Ok(Self {
            index,
            count,
            salt: Vec::new(),
        })
    }

    /// The single-worker configuration: accepts every name.
    pub fn single() -> Self {
        Self {
            index: 0,
            count: 1,
            salt: Vec::new(),
        }
    }

    /// Replaces the digest salt.
    pub fn with_salt(mut self, salt: impl Into<Vec<u8>>) -> Self {
        self.salt = salt.into();
        self
    }

    /// Zero-based index of this worker.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Total number of workers.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Reads the configuration from the environment.
    ///
    /// `GRIDTEST_WORKER_INDEX` / `GRIDTEST_WORKER_COUNT` take precedence;
    /// CircleCI's `CIRCLE_NODE_INDEX` / `CIRCLE_NODE_TOTAL` are honored as a
    /// fallback. Absent variables default to worker 0 of 1.
    pub fn from_env() -> Result<Self, ShardError> {
        let index = match read_env_u32(ENV_WORKER_INDEX)? {
            Some(index) => index,
            None => read_env_u32(ENV_CIRCLE_INDEX)?.unwrap_or(0),
        };
        let count = match read_env_u32(ENV_WORKER_COUNT)? {
            Some(count) => count,
            None => read_env_u32(ENV_CIRCLE_COUNT)?.unwrap_or(1),
        };
        let config = Self::new(index, count)?;
        match std::env::var(ENV_SHARD_SALT) {
            Ok(salt) => Ok(config.with_salt(salt.into_bytes())),
            Err(_) => Ok(config),
        }
    }

    /// The process-wide configuration, read from the environment on first use.
    ///
    /// Worker index and count cannot change mid-run, so the value is computed
    /// once and reused for the lifetime of the process.
    pub fn current() -> Result<&'static ShardConfig, ShardError> {
        static CURRENT: OnceLock<ShardConfig> = OnceLock::new();
        if let Some(config) = CURRENT.get() {
            return Ok(config);
        }
        let config = Self::from_env()?;
        Ok(CURRENT.get_or_init(|| config))
    }

    /// Returns whether this worker accepts `name`.
    pub fn accepts(&self, name: &str) -> bool {
        accept_name_salted(name, &self.salt, self.index, self.count)
    }
}

fn read_env_u32(var: &'static str) -> Result<Option<u32>, ShardError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| ShardError::InvalidVar { var, value }),
        Err(_) => Ok(None),
    }
}
