//! Node configuration. Values are loaded from built-in defaults, an optional
//! configuration file (in any format supported by the config crate, by file
//! extension), and RAFTCORE_* environment variables, in increasing order of
//! precedence. For example, RAFTCORE_PRE_VOTE=false disables pre-voting.

use crate::error::Result;
use crate::raft::{self, NodeID, Ticks};

use serde::Deserialize;

/// The environment variable prefix.
const ENV_PREFIX: &str = "RAFTCORE";

/// Raft node configuration.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Config {
    /// The node ID.
    pub id: NodeID,
    /// The log level: off, error, warn, info, debug or trace.
    pub log_level: String,
    /// Ticks between leader heartbeats.
    pub heartbeat_interval: Ticks,
    /// The minimum election timeout in ticks, inclusive.
    pub election_timeout_min: Ticks,
    /// The maximum election timeout in ticks, exclusive.
    pub election_timeout_max: Ticks,
    /// The maximum number of entries per append message.
    pub max_append_entries: usize,
    /// Applied entries after which the log is compacted. 0 disables it.
    pub snapshot_threshold: u64,
    /// The size of snapshot chunks in bytes.
    pub snapshot_chunk_size: usize,
    /// Poll voters before campaigning.
    pub pre_vote: bool,
    /// Step down as leader without contact to a quorum.
    pub check_quorum: bool,
    /// Ticks before an unanswered peer request fails with a timeout.
    pub request_timeout: Ticks,
}

impl Config {
    /// Loads the configuration, from the given file if any.
    pub fn load(file: Option<&str>) -> Result<Self> {
        Self::load_with_prefix(file, ENV_PREFIX)
    }

    fn load_with_prefix(file: Option<&str>, env_prefix: &str) -> Result<Self> {
        let defaults = raft::Options::default();
        let mut builder = config::Config::builder()
            .set_default("id", 1_i64)?
            .set_default("log_level", "info")?
            .set_default("heartbeat_interval", i64::from(defaults.heartbeat_interval))?
            .set_default("election_timeout_min", i64::from(defaults.election_timeout_range.start))?
            .set_default("election_timeout_max", i64::from(defaults.election_timeout_range.end))?
            .set_default("max_append_entries", defaults.max_append_entries as i64)?
            .set_default("snapshot_threshold", defaults.snapshot_threshold as i64)?
            .set_default("snapshot_chunk_size", defaults.snapshot_chunk_size as i64)?
            .set_default("pre_vote", defaults.pre_vote)?
            .set_default("check_quorum", defaults.check_quorum)?
            .set_default("request_timeout", i64::from(raft::REQUEST_TIMEOUT))?;
        if let Some(file) = file {
            builder = builder.add_source(config::File::from(std::path::Path::new(file)));
        }
        builder = builder.add_source(config::Environment::with_prefix(env_prefix).try_parsing(true));
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Returns the validated Raft options.
    pub fn raft_options(&self) -> Result<raft::Options> {
        let opts = raft::Options {
            heartbeat_interval: self.heartbeat_interval,
            election_timeout_range: self.election_timeout_min..self.election_timeout_max,
            max_append_entries: self.max_append_entries,
            snapshot_threshold: self.snapshot_threshold,
            snapshot_chunk_size: self.snapshot_chunk_size,
            pre_vote: self.pre_vote,
            check_quorum: self.check_quorum,
        };
        opts.validate()?;
        Ok(opts)
    }

    /// Returns the parsed log level.
    pub fn log_level(&self) -> Result<::log::LevelFilter> {
        Ok(self.log_level.parse()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use pretty_assertions::assert_eq;
    use std::io::Write as _;

    #[test]
    fn defaults() -> Result<()> {
        let config = Config::load_with_prefix(None, "RAFTCORE_TEST_DEFAULTS")?;
        assert_eq!(config.id, 1);
        assert_eq!(config.log_level()?, ::log::LevelFilter::Info);
        assert_eq!(config.request_timeout, raft::REQUEST_TIMEOUT);
        assert_eq!(config.raft_options()?, raft::Options::default());
        Ok(())
    }

    #[test]
    fn file_and_environment() -> Result<()> {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile()?;
        writeln!(file, "id: 3")?;
        writeln!(file, "log_level: debug")?;
        writeln!(file, "election_timeout_min: 6")?;
        writeln!(file, "election_timeout_max: 9")?;
        writeln!(file, "pre_vote: false")?;
        file.flush()?;

        // The environment takes precedence over the file.
        std::env::set_var("RAFTCORE_TEST_FILE_ID", "4");
        std::env::set_var("RAFTCORE_TEST_FILE_SNAPSHOT_THRESHOLD", "0");
        let path = file.path().to_str().map(str::to_string);
        let config = Config::load_with_prefix(path.as_deref(), "RAFTCORE_TEST_FILE")?;
        assert_eq!(config.id, 4);
        assert_eq!(config.log_level()?, ::log::LevelFilter::Debug);

        let opts = config.raft_options()?;
        assert_eq!(opts.election_timeout_range, 6..9);
        assert_eq!(opts.snapshot_threshold, 0);
        assert!(!opts.pre_vote);
        assert!(opts.check_quorum);
        Ok(())
    }

    #[test]
    fn missing_file() {
        assert!(matches!(
            Config::load_with_prefix(Some("/nonexistent/raftcore.yaml"), "RAFTCORE_TEST_MISSING"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn invalid_options() -> Result<()> {
        // Heartbeat at the election timeout, empty election range, zero heartbeat.
        for (heartbeat_interval, min, max) in [(4, 4, 8), (2, 8, 8), (0, 4, 8)] {
            let mut config = Config::load_with_prefix(None, "RAFTCORE_TEST_INVALID")?;
            config.heartbeat_interval = heartbeat_interval;
            config.election_timeout_min = min;
            config.election_timeout_max = max;
            assert!(matches!(config.raft_options(), Err(Error::InvalidInput(_))));
        }
        Ok(())
    }

    #[test]
    fn invalid_log_level() -> Result<()> {
        let mut config = Config::load_with_prefix(None, "RAFTCORE_TEST_LEVEL")?;
        config.log_level = "loud".into();
        assert!(matches!(config.log_level(), Err(Error::InvalidInput(_))));
        Ok(())
    }
}
