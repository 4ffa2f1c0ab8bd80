use std::io::{self, BufRead, Write};
use std::process;
use std::str;
use std::time::Duration;

use bytes::Bytes;
use chrono::Local;
use clap::Parser;
use log::error;

use zonekv::paxos::PolicyConfig;
use zonekv::{Client, ClientError, Cluster, ClusterConfig};

/// Runs a zoned replica group in this process and serves `get`, `put` and `del` commands read from stdin.
#[derive(Parser, Debug)]
#[command(name = "zonekv")]
struct Cli {
    /// Number of zones.
    #[arg(short = 'z', default_value_t = 3)]
    zones: u16,

    /// Replicas per zone.
    #[arg(short = 'n', default_value_t = 3)]
    nodes: u16,

    /// Zone failures to tolerate; 0 uses plain majorities.
    #[arg(short = 'f', default_value_t = 0)]
    fz: usize,

    /// Leader migration policy: null, consecutive:<n>, majority:<millis> or ema:<alpha>.
    #[arg(long, default_value = "null")]
    policy: PolicyConfig,

    /// Upper bound of the randomized election retry delay, in milliseconds.
    #[arg(long, default_value_t = 100)]
    backoff: u64,

    /// Answer clients once a command commits instead of once it executes.
    #[arg(long)]
    reply_on_commit: bool,

    /// Zone the interactive client issues requests from.
    #[arg(long, default_value_t = 1)]
    zone: u16,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = ClusterConfig::uniform(cli.zones, cli.nodes);
    config.paxos.fz = cli.fz;
    config.paxos.policy = cli.policy;
    config.paxos.backoff = Duration::from_millis(cli.backoff);
    config.paxos.reply_when_commit = cli.reply_on_commit;

    let cluster = match Cluster::start(config) {
        Ok(cluster) => cluster,
        Err(err) => {
            error!("{}", err);
            process::exit(1);
        }
    };
    let mut client = match cluster.client(cli.zone) {
        Ok(client) => client,
        Err(err) => {
            error!("{}", err);
            process::exit(1);
        }
    };

    println!("{}", usage());
    let stdin = io::stdin();
    prompt();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                error!("cannot read stdin: {}", err);
                break;
            }
        };
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => {}
            ["exit"] | ["quit"] => break,
            _ => match run(&mut client, &words) {
                Some(result) => report(result),
                None => println!("{}", usage()),
            },
        }
        prompt();
    }

    let _ = cluster.shutdown();
}

fn usage() -> &'static str {
    "\n\t get KEY \n\t put KEY VALUE \n\t del KEY \n\t exit"
}

fn prompt() {
    print!("zonekv $ ");
    let _ = io::stdout().flush();
}

/// Runs one command line, or returns `None` if it is malformed.
fn run(client: &mut Client, words: &[&str]) -> Option<Result<Option<Bytes>, ClientError>> {
    let (command, key, rest) = match words {
        [command, key, rest @ ..] => (*command, key.parse::<u64>().ok()?, rest),
        _ => return None,
    };
    match (command, rest) {
        ("get", []) => Some(client.get(key)),
        ("put", [value]) => Some(client.put(key, value.to_string())),
        ("del", []) => Some(client.delete(key)),
        _ => None,
    }
}

fn report(result: Result<Option<Bytes>, ClientError>) {
    let now = Local::now().format("%H:%M:%S%.3f");
    match result {
        Ok(Some(value)) => match str::from_utf8(&value) {
            Ok(text) => println!("{} {}", now, text),
            Err(_) => println!("{} {:?}", now, value),
        },
        Ok(None) => println!("{} (nil)", now),
        Err(err) => println!("{} error: {}", now, err),
    }
}
