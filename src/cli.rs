use clap::{Args, Parser, Subcommand, ValueEnum};
use rdw_dashboard::query::SimpleOperation;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// JSON config file (defaults to ./rdw-dashboard.json when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the dataset CSV files
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Tab-separated dataset catalog replacing the built-in registry
    #[arg(long, global = true)]
    pub catalog: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download new or changed datasets
    Sync(SyncArgs),
    /// Show registry entries, local files and stored download metadata
    Status,
    /// Run a pivot request read from a JSON file
    Pivot {
        #[arg(short, long)]
        request: PathBuf,
    },
    /// Unique values or counts for a single field
    Query(QueryArgs),
    /// Show every column for one license plate
    Lookup { kenteken: String },
    /// List the columns of the unified view
    Columns,
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Process datasets one at a time
    #[arg(long)]
    pub sequential: bool,

    /// Number of concurrent downloads
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Download even when the local copy looks current
    #[arg(short, long)]
    pub force: bool,

    /// Only synchronize these datasets
    #[arg(long = "dataset")]
    pub datasets: Vec<String>,
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    #[arg(short, long)]
    pub field: String,

    #[arg(short, long, value_enum)]
    pub operation: OperationArg,

    #[arg(short, long, default_value = "100")]
    pub limit: usize,

    /// Second field to group counts by
    #[arg(short, long)]
    pub pivot_field: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum OperationArg {
    Unique,
    Count,
}

impl From<OperationArg> for SimpleOperation {
    fn from(arg: OperationArg) -> Self {
        match arg {
            OperationArg::Unique => SimpleOperation::Unique,
            OperationArg::Count => SimpleOperation::Count,
        }
    }
}
