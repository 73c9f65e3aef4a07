use clap::Parser;

/// One node of a replicated, quorum-based key-value store.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Config {
    /// Address this node listens on, e.g. 127.0.0.1:7401
    #[arg(short, long, required = true)]
    pub listen: String,

    /// Peer addresses to mesh with
    #[arg(short, long, required = true, value_delimiter = ',')]
    pub peers: Vec<String>,

    /// Number of operations to issue
    #[arg(short, long, default_value = "10000")]
    pub num_ops: usize,

    /// Range of distinct keys in the workload
    #[arg(short, long, default_value = "1000")]
    pub key_range: u64,

    /// Milliseconds between engine ticks
    #[arg(short, long, default_value = "20")]
    pub tick_ms: u64,

    /// Operations issued per tick
    #[arg(short, long, default_value = "64")]
    pub batch: usize,
}
