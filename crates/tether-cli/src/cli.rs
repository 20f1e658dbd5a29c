//! Clap CLI definitions for tether.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  tether relay                                 Run the relay with ~/.tether/config.toml
  tether agent --server-url ws://relay:8080    Attach this machine to a relay
  tether sample-file big.bin --size-mb 50      Write 50 MiB of random data

\x1b[1;36mTrigger a download:\x1b[0m
  curl -X POST http://relay:3000/api/download/request \\
       -H 'content-type: application/json' \\
       -d '{\"clientId\":\"<agent id>\",\"filePath\":\"/var/log/syslog\"}'";

/// Pull files from agents behind NAT through a relay they dial into.
#[derive(Parser)]
#[command(name = "tether", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the relay: HTTP API plus the agent listener.
    Relay {
        /// HTTP API address (overrides relay.http_listen).
        #[arg(long)]
        http_listen: Option<SocketAddr>,
        /// Agent WebSocket address (overrides relay.agent_listen).
        #[arg(long)]
        agent_listen: Option<SocketAddr>,
        /// Where completed downloads are written.
        #[arg(long)]
        downloads_dir: Option<PathBuf>,
        /// Per-request timeout in seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Run an agent that dials the relay and serves file requests.
    Agent {
        /// Relay WebSocket URL (overrides agent.server_url).
        #[arg(long)]
        server_url: Option<String>,
        /// Stable agent id. Generated when absent.
        #[arg(long)]
        id: Option<String>,
        /// Display name.
        #[arg(long)]
        name: Option<String>,
    },
    /// Write a file of random bytes for transfer testing.
    SampleFile {
        /// Output path.
        path: PathBuf,
        /// Size in MiB.
        #[arg(long, default_value_t = 10)]
        size_mb: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_relay_overrides() {
        let cli = Cli::try_parse_from([
            "tether",
            "--config",
            "/etc/tether.toml",
            "relay",
            "--agent-listen",
            "127.0.0.1:9000",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/tether.toml")));
        match cli.command {
            Commands::Relay {
                agent_listen,
                http_listen,
                ..
            } => {
                assert_eq!(agent_listen, Some("127.0.0.1:9000".parse().unwrap()));
                assert!(http_listen.is_none());
            }
            _ => panic!("Expected relay command"),
        }
    }

    #[test]
    fn test_sample_file_default_size() {
        let cli = Cli::try_parse_from(["tether", "sample-file", "out.bin"]).unwrap();
        match cli.command {
            Commands::SampleFile { path, size_mb } => {
                assert_eq!(path, PathBuf::from("out.bin"));
                assert_eq!(size_mb, 10);
            }
            _ => panic!("Expected sample-file command"),
        }
    }
}
