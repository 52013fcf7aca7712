//! Command-line client.
//!
//! ```bash
//! chr-client --config cluster.toml who-master
//! chr-client --config cluster.toml set greeting hello
//! chr-client --config cluster.toml --dirty get greeting
//! RUST_LOG=chr_client=debug chr-client --config cluster.toml statistics
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueHint};
use tracing_subscriber::EnvFilter;

use chr_client::{Client, ClientError, ClusterConfig, KeyRange, NodeId};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Cluster configuration file (TOML).
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: PathBuf,

    /// Serve reads from a single node without going through the master.
    #[arg(long)]
    dirty: bool,

    /// Node to use for dirty reads. Random when omitted.
    #[arg(long, requires = "dirty")]
    dirty_node: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the current master.
    WhoMaster,
    /// Print the value of a key.
    Get { key: String },
    /// Set a key.
    Set { key: String, value: String },
    /// Delete a key.
    Delete { key: String },
    /// Print whether a key exists.
    Exists { key: String },
    /// List keys with a prefix.
    Prefix {
        prefix: String,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// List key-value pairs in a range.
    RangeEntries {
        #[arg(long)]
        begin: Option<String>,
        #[arg(long)]
        end: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Print the number of keys on the master.
    KeyCount,
    /// Print master statistics.
    Statistics,
    /// Print the server version of a node, or of the master.
    Version { node: Option<String> },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ClusterConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let client = Client::new(config).context("creating client")?;

    if cli.dirty {
        client.allow_dirty_reads();
        if let Some(node) = cli.dirty_node {
            client.set_dirty_read_node(node)?;
        }
    }

    run(&client, cli.command)
}

fn run(client: &Client, command: Command) -> Result<()> {
    match command {
        Command::WhoMaster => println!("{}", client.who_master()?),
        Command::Get { key } => match client.get(&key) {
            Ok(value) => println!("{}", String::from_utf8_lossy(&value)),
            Err(ClientError::NotFound(_)) => anyhow::bail!("key not found: {}", key),
            Err(e) => return Err(e.into()),
        },
        Command::Set { key, value } => client.set(&key, &value)?,
        Command::Delete { key } => client.delete(&key)?,
        Command::Exists { key } => println!("{}", client.exists(&key)?),
        Command::Prefix { prefix, limit } => {
            for key in client.prefix(&prefix, limit)? {
                println!("{}", String::from_utf8_lossy(&key));
            }
        }
        Command::RangeEntries { begin, end, limit } => {
            let mut range = KeyRange::all();
            if let Some(begin) = begin {
                range = range.begin(begin, true);
            }
            if let Some(end) = end {
                range = range.end(end, false);
            }
            if let Some(limit) = limit {
                range = range.limit(limit);
            }
            for (key, value) in client.range_entries(&range)? {
                println!(
                    "{}\t{}",
                    String::from_utf8_lossy(&key),
                    String::from_utf8_lossy(&value)
                );
            }
        }
        Command::KeyCount => println!("{}", client.get_key_count()?),
        Command::Statistics => {
            let stats = client.statistics()?;
            println!("start      {:.3}", stats.start);
            println!("last       {:.3}", stats.last);
            println!("sets       {}", stats.n_sets);
            println!("gets       {}", stats.n_gets);
            println!("deletes    {}", stats.n_deletes);
            println!("multigets  {}", stats.n_multigets);
            println!("sequences  {}", stats.n_sequences);
            println!("entries    {}", stats.n_entries);
            for (node, index) in &stats.node_is {
                println!("node_is    {} {}", node, index);
            }
        }
        Command::Version { node } => {
            let node = node.map(NodeId::from);
            let version = client.get_version(node.as_ref())?;
            println!(
                "{}.{}.{} {}",
                version.major, version.minor, version.patch, version.info
            );
        }
    }
    Ok(())
}
