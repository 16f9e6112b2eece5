// ABOUTME: Command-line interface definitions using clap
// ABOUTME: Defines all subcommands and global flags

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "notedown")]
#[command(about = "Export notes from a WizNote-compatible server to Markdown", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config file path (defaults below config.json in the working directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Access token (overrides session file and env)
    #[arg(long, global = true)]
    pub token: Option<String>,

    /// Knowledge-base server URL
    #[arg(long, global = true)]
    pub api_base: Option<String>,

    /// Knowledge-base identifier
    #[arg(long, global = true)]
    pub kb: Option<String>,

    /// Override output directory
    #[arg(long, global = true)]
    pub output: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Sync notes from the server (default)
    Sync {
        /// Limit the run to these folders (all non-excluded when empty)
        folders: Vec<String>,

        /// Skip notes whose stored copy is already current
        #[arg(long, short = 'i')]
        incremental: bool,

        /// Store raw HTML instead of converting to Markdown
        #[arg(long)]
        no_convert: bool,

        /// Put every note directly under the team directory
        #[arg(long)]
        flat: bool,

        /// Max in-flight note fetches per folder
        #[arg(long, short = 'c')]
        concurrency: Option<usize>,

        /// Skip declared attachments
        #[arg(long)]
        no_attachments: bool,

        /// Omit the metadata front-matter block
        #[arg(long)]
        no_frontmatter: bool,
    },

    /// List the folders on the server
    Folders,

    /// Import packaged note bundles from a local directory
    Import {
        /// Directory containing the bundles
        dir: PathBuf,

        /// Team directory to import into
        #[arg(long, default_value = "Imported")]
        team: String,
    },
}

impl Cli {
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Sync {
            folders: Vec::new(),
            incremental: false,
            no_convert: false,
            flat: false,
            concurrency: None,
            no_attachments: false,
            no_frontmatter: false,
        })
    }
}
