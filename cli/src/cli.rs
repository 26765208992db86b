use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

#[derive(Parser)]
#[command(name = "loghub", about = "loghub administrative client")]
pub struct Cli {
    #[clap(flatten)]
    pub global_args: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print daemon statistics
    Stats {
        /// Partitions to include; all when omitted
        #[arg(short = 'b', long = "buffer")]
        buffers: Vec<String>,

        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },

    /// Clear one partition
    Clear {
        #[arg(short = 'b', long = "buffer")]
        buffer: String,

        /// Only remove records owned by this uid
        #[arg(long)]
        uid: Option<u32>,
    },

    /// Print or replace the prune configuration
    Prune {
        /// New prune specification, e.g. 'main: ~1000 !2000'
        #[arg(long)]
        set: Option<String>,
    },

    /// Look up (or allocate) an event tag id
    Tag {
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "")]
        format: String,
    },

    /// Rotate and reload the event-tag dictionary
    Reinit,

    /// Print or change a partition's byte quota
    Quota {
        #[arg(short = 'b', long = "buffer")]
        buffer: String,

        /// New quota in bytes
        #[arg(long)]
        set: Option<usize>,
    },

    /// Dump records and exit
    Cat {
        #[clap(flatten)]
        read_args: ReadArgs,
    },

    /// Stream records until interrupted
    Tail {
        #[clap(flatten)]
        read_args: ReadArgs,
    },
}

#[derive(Debug, Args)]
pub struct ReadArgs {
    /// Partitions to read; all when omitted
    #[arg(short = 'b', long = "buffer")]
    pub buffers: Vec<String>,

    /// Start with only the last <N> matching records
    #[arg(short = 't', long)]
    pub tail: Option<usize>,

    /// Only records from this pid
    #[arg(long)]
    pub pid: Option<u32>,

    /// Only records from this uid
    #[arg(long)]
    pub uid: Option<u32>,

    /// Minimum priority (2=verbose .. 7=fatal) for text partitions
    #[arg(long)]
    pub level: Option<u8>,

    /// Only records at or after this realtime, as <sec>.<nsec>
    #[arg(long)]
    pub start: Option<String>,
}

#[derive(Args)]
pub struct GlobalArgs {
    /// Log level
    #[clap(long, global = true, default_value_t = LevelFilter::Warn)]
    pub log_level: LevelFilter,
}
