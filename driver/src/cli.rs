use clap::Parser;

/// Producer/consumer driver for the bounded queue
#[derive(Debug, Clone, Parser)]
pub struct Args {
    /// Number of queue slots
    #[arg(short, long, default_value_t = 16)]
    pub capacity: usize,

    /// Number of producer threads
    #[arg(short, long, default_value_t = 4)]
    pub producers: usize,

    /// Number of consumer threads
    #[arg(short = 'n', long, default_value_t = 4)]
    pub consumers: usize,

    /// Items inserted by each producer
    ///
    /// Set to 0 to produce until CTRL-C
    #[arg(short, long, default_value_t = 100_000)]
    pub items: usize,

    /// Seed for the random payloads
    #[arg(long)]
    pub seed: Option<u64>,
}
