use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "Tessera Validator",
    author = "Tessera Developers",
    version = "0.1.0",
    about = "Permissioned chain node: validates, plays and produces blocks"
)]
pub struct NodeCliArgs {
    /// Node configuration file (TOML)
    #[arg(
        short,
        long,
        help = "Path to the node configuration; defaults to TESSERA_CONFIG or config/node.toml"
    )]
    pub config: Option<PathBuf>,

    /// Raw genesis block produced by the first node
    #[arg(short, long, help = "Genesis block file to start the chain from")]
    pub genesis: Option<PathBuf>,

    /// Writes this node's genesis block to a file
    #[arg(long, help = "Write the genesis block to this file after start-up")]
    pub export_genesis: Option<PathBuf>,

    /// Directory of raw blocks to apply before the pipeline starts
    #[arg(short, long, help = "Apply every *.block file in this directory, in name order")]
    pub import: Option<PathBuf>,

    /// Directory generated blocks are written to
    #[arg(short, long, help = "Write each generated block to this directory")]
    pub export_dir: Option<PathBuf>,

    /// JSON array of transactions queued at start-up
    #[arg(short, long, help = "Queue the transactions in this JSON file")]
    pub transactions: Option<PathBuf>,

    /// Rolls the chain back and exits
    #[arg(long, help = "Roll the chain back to this height after importing, then exit")]
    pub rollback_to: Option<i64>,

    /// Log level for node operation
    #[arg(
        short,
        long,
        default_value = "info",
        help = "Set the logging level",
        value_parser = ["error", "warn", "info", "debug", "trace"]
    )]
    pub log_level: String,
}

impl NodeCliArgs {
    pub fn get_log_level(&self) -> tracing::Level {
        match self.log_level.as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "info" => tracing::Level::INFO,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = NodeCliArgs::parse_from(["tessera-validator"]);
        assert_eq!(args.get_log_level(), tracing::Level::INFO);
        assert!(args.config.is_none());
        assert!(args.rollback_to.is_none());
    }

    #[test]
    fn test_rollback_and_level() {
        let args = NodeCliArgs::parse_from([
            "tessera-validator",
            "--rollback-to",
            "4",
            "--log-level",
            "debug",
            "--import",
            "blocks",
        ]);
        assert_eq!(args.rollback_to, Some(4));
        assert_eq!(args.get_log_level(), tracing::Level::DEBUG);
        assert_eq!(args.import, Some(PathBuf::from("blocks")));
    }

    #[test]
    fn test_unknown_level_rejected() {
        assert!(NodeCliArgs::try_parse_from(["tessera-validator", "-l", "loud"]).is_err());
    }
}
