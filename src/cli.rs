use crate::dialect::Dialect;
use clap::Parser;
use std::path::PathBuf;

/// FedSQL - federated SQL middleware engine
#[derive(Parser, Debug, Clone)]
#[command(name = "fedsql")]
#[command(version, long_about = None)]
#[command(about = "One SQL-92 surface over MySQL, PostgreSQL and Elasticsearch")]
pub struct Args {
    /// SQL statement (positional, used by --translate and plain execution)
    #[arg(value_name = "SQL")]
    pub sql: Option<String>,

    /// Path to the engine configuration file
    #[arg(long, default_value = "fedsql.toml")]
    pub config: PathBuf,

    /// Translate the statement between dialects instead of executing it
    #[arg(long)]
    pub translate: bool,

    /// Source dialect for --translate
    #[arg(long, value_enum)]
    pub from: Option<Dialect>,

    /// Target dialect for --translate
    #[arg(long, value_enum)]
    pub to: Option<Dialect>,

    /// Execute statements from a file, one result per statement
    #[arg(short = 'f', long = "file")]
    pub file: Option<PathBuf>,

    /// Execute a single SQL command and exit
    #[arg(short = 'c', long = "command")]
    pub command: Option<String>,
}
