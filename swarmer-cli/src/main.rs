use std::{
    io::{BufRead, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use clap::{Parser, Subcommand};
use color_eyre::Result;
use swarmer::{GetOutcome, NameFilter, Node, NodeConfig, PieceIdx, Tracker, TrackerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const BAR_WIDTH: u32 = 30;

pub struct ProgressDisplay {
    owned: u32,
    total: u32,
}

impl std::fmt::Display for ProgressDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ratio = if self.total == 0 {
            1.0
        } else {
            f64::from(self.owned) / f64::from(self.total)
        };
        let filled = (ratio * f64::from(BAR_WIDTH)).round() as u32;
        f.write_str("[")?;
        for i in 0..BAR_WIDTH {
            f.write_str(if i < filled { "#" } else { "-" })?;
        }
        write!(
            f,
            "] {:>3.0}% ({}/{})",
            ratio * 100.0,
            self.owned,
            self.total
        )
    }
}

#[derive(Debug, Parser)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the tracker.
    Tracker(TrackerArgs),
    /// Run a node with an interactive shell.
    Node(NodeArgs),
}

#[derive(Debug, clap::Args)]
struct TrackerArgs {
    #[clap(long, default_value = "0.0.0.0:9090")]
    listen: SocketAddr,
}

#[derive(Debug, clap::Args)]
struct NodeArgs {
    #[clap(long, default_value = "127.0.0.1:9090")]
    tracker: SocketAddr,

    #[clap(long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    #[clap(long, default_value = "files")]
    files: PathBuf,

    #[clap(long)]
    metadata: Option<PathBuf>,

    #[clap(long, default_value_t = 4)]
    workers: usize,

    #[clap(long, default_value_t = swarmer::PIECE_SIZE)]
    piece_size: u32,

    /// Seconds an answered request stays cached.
    #[clap(long, default_value_t = 60)]
    expire: u64,

    #[clap(long, default_value_t = 2000)]
    request_timeout_ms: u64,

    #[clap(long, default_value_t = 3)]
    attempts: u32,
}

fn main() -> Result<()> {
    let args = Args::parse();
    color_eyre::install()?;
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))?;
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter_layer)
        .init();

    match args.command {
        Command::Tracker(args) => run_tracker(args),
        Command::Node(args) => run_node(args),
    }
}

fn run_tracker(args: TrackerArgs) -> Result<()> {
    let tracker = Tracker::bind(TrackerConfig {
        listen: args.listen,
    })?;
    tracker.run()?;
    Ok(())
}

fn run_node(args: NodeArgs) -> Result<()> {
    let config = NodeConfig {
        tracker: args.tracker,
        bind: args.bind,
        files_dir: args.files,
        metadata_path: args.metadata,
        workers: args.workers,
        piece_size: args.piece_size,
        expire: Duration::from_secs(args.expire),
        request_timeout: Duration::from_millis(args.request_timeout_ms),
        attempts: args.attempts,
        ..Default::default()
    };
    let node = Arc::new(Node::start(config)?);
    watch_ctrl_c(node.clone())?;
    shell(&node)?;
    node.shutdown()?;
    Ok(())
}

// on ctrl-c, waits for downloads to commit the piece at hand, persists and exits
fn watch_ctrl_c(node: Arc<Node>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::spawn(move || {
        runtime.block_on(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for ctrl-c");
                return;
            }
            let code = match node.shutdown() {
                Ok(()) => 0,
                Err(err) => {
                    tracing::error!(error = %err, "failed to persist inventory");
                    1
                }
            };
            std::process::exit(code);
        })
    });
    Ok(())
}

fn shell(node: &Node) -> Result<()> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut line = String::new();
    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let words = line.split_whitespace().collect::<Vec<_>>();
        if words.as_slice() == ["exit"] {
            break;
        }
        if let Err(err) = dispatch(node, &words) {
            println!("Error: {err}");
        }
    }
    Ok(())
}

fn dispatch(node: &Node, words: &[&str]) -> std::io::Result<()> {
    match words {
        [] => {}
        ["get", file] => match node.get(file)? {
            GetOutcome::NotFound => println!("File not found in the swarm."),
            GetOutcome::Progress { owned, total } => {
                println!("{file} {}", ProgressDisplay { owned, total });
            }
        },
        ["ls"] => print_names(node.ls(NameFilter::All)),
        ["ls", "-c"] => print_names(node.ls(NameFilter::Complete)),
        ["ls", "-i"] => print_names(node.ls(NameFilter::Incomplete)),
        ["check", "-all"] => {
            for (name, owned, total) in node.check_all() {
                println!("{name} {}", ProgressDisplay { owned, total });
            }
        }
        ["check", file] => match node.check(file) {
            Some((owned, total)) => println!("{file} {}", ProgressDisplay { owned, total }),
            None => println!("File does not exist."),
        },
        ["delete", "-all"] => {
            let removed = node.delete_all()?;
            println!("Deleted {removed} files.");
        }
        ["delete", "-f", file] => {
            if !node.delete_file(file)? {
                println!("File does not exist.");
            }
        }
        ["delete", "-p", file, piece] => match piece.parse::<u32>() {
            Ok(piece) => {
                if !node.delete_piece(file, PieceIdx::new(piece))? {
                    println!("Piece not owned.");
                }
            }
            Err(_) => println!("Invalid piece index."),
        },
        ["load"] => {
            let entries = node.load()?;
            println!("Loaded {} new files.", entries.len());
        }
        _ => println!("Command not found."),
    }
    Ok(())
}

fn print_names(names: Vec<String>) {
    for name in names {
        println!("{name}");
    }
}
