//! Runs a simulated Raft cluster in-process. It elects a leader, submits
//! writes, optionally partitions the leader away to force a new election,
//! and prints the status of each node. For example:
//!
//! cargo run --bin raftsim -- --nodes 5 --writes 100 --partition
//!
//! Raft options are read from the configuration file given by --config, and
//! RAFTCORE_* environment variables. See --help for arguments.

#![warn(clippy::all)]

use clap::Parser;
use raftcore::config::Config;
use raftcore::error::{Error, Result};
use raftcore::raft::sim::Cluster;
use raftcore::raft::{NodeID, Request};

use ::log::{error, info};

fn main() -> Result<()> {
    let command = Command::parse();
    let config = Config::load(command.config.as_deref())?;

    let loglevel = config.log_level()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug && loglevel != simplelog::LevelFilter::Trace {
        logconfig.add_filter_allow_str("raftcore");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    command.run(config)
}

/// Handles command-line parsing.
#[derive(clap::Parser)]
#[command(about = "Runs a simulated Raft cluster.", version)]
struct Command {
    /// Configuration file path.
    #[arg(short = 'c', long)]
    config: Option<String>,

    /// Number of voters in the cluster.
    #[arg(short, long, default_value = "3")]
    nodes: NodeID,

    /// Maximum number of ticks to wait for each election.
    #[arg(short, long, default_value = "200")]
    ticks: usize,

    /// Number of writes to submit to the leader.
    #[arg(short, long, default_value = "10")]
    writes: u64,

    /// Isolate the leader after the writes, and wait for a new one.
    #[arg(short, long)]
    partition: bool,
}

impl Command {
    fn run(self, config: Config) -> Result<()> {
        let mut cluster = Cluster::new(self.nodes, config.raft_options()?)?;
        let leader = Self::elect(&mut cluster, self.ticks, None)?;

        let mut failed = 0;
        for i in 0..self.writes {
            let id = cluster.submit(leader, Request::Write(i.to_be_bytes().to_vec()))?;
            cluster.deliver_all()?;
            match cluster.response(&id) {
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    error!("Write {i} failed: {err}");
                    failed += 1;
                }
                None => {
                    error!("Write {i} did not complete");
                    failed += 1;
                }
            }
        }
        info!("Wrote {} of {} entries via leader {leader}", self.writes - failed, self.writes);

        if self.partition {
            cluster.isolate(leader);
            Self::elect(&mut cluster, self.ticks, Some(leader))?;
            cluster.heal_all();
        }
        cluster.run(self.ticks)?;
        cluster.check_consistency()?;

        for id in cluster.ids() {
            let status = cluster.status(id)?;
            println!(
                "node {} {:?} term={} leader={} last={} commit={} applied={} snapshot={} voters={:?}",
                status.id,
                status.role,
                status.term,
                status.leader.map_or("none".to_string(), |l| l.to_string()),
                status.last_index,
                status.commit_index,
                status.applied_index,
                status.snapshot_index,
                status.configuration.voters(),
            );
        }
        Ok(())
    }

    /// Runs the cluster until a leader other than the given one is elected.
    fn elect(cluster: &mut Cluster, ticks: usize, not: Option<NodeID>) -> Result<NodeID> {
        let elected = |c: &Cluster| c.leader().is_some_and(|l| Some(l) != not);
        if !cluster.run_until(ticks, elected)? {
            return Err(Error::InvalidData(format!("no leader elected in {ticks} ticks")));
        }
        let leader = cluster.leader().ok_or(Error::InvalidData("no leader".into()))?;
        info!("Node {leader} is leader");
        Ok(leader)
    }
}
