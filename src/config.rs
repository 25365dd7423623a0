//! Plain, programmatically-constructed configuration for each service.
//! There is no file/env loader: the external-interface contract for this
//! system is "environment variables: none, persisted state: none", so a
//! thin CLI layer (out of scope here) is expected to build these directly.

use std::path::PathBuf;
use std::time::Duration;

/// Thread pool sizing shared by every service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// `0` means unbounded concurrency.
    pub max_threads: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig { max_threads: 0 }
    }
}

/// Configuration for a bare message-passing [`crate::communication::server::Server`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen_port: u16,
    pub pool: PoolConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_port: 0,
            pool: PoolConfig::default(),
        }
    }
}

/// Configuration for the FTP file service: two ports (commands and
/// termination) plus the directory its [`crate::fs::ThreadSafeFileHandler`]
/// is rooted at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpServerConfig {
    pub command_port: u16,
    pub terminate_port: u16,
    pub root_dir: PathBuf,
    pub pool: PoolConfig,
}

impl Default for FtpServerConfig {
    fn default() -> Self {
        FtpServerConfig {
            command_port: 0,
            terminate_port: 0,
            root_dir: PathBuf::from("."),
            pool: PoolConfig::default(),
        }
    }
}

/// Configuration for the pub/sub coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub listen_port: u16,
    pub replay_threshold: Duration,
    pub pool: PoolConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            listen_port: 0,
            replay_threshold: Duration::from_secs(60),
            pool: PoolConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_unbounded_pool_and_loopback_ready() {
        let pool = PoolConfig::default();
        assert_eq!(pool.max_threads, 0);

        let coordinator = CoordinatorConfig::default();
        assert_eq!(coordinator.replay_threshold, Duration::from_secs(60));
    }
}
