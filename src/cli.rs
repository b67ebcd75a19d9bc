use clap::{Args, Parser, Subcommand};
use fastdbfs_filter::{RuleKind, RuleSpec};
use std::ffi::OsString;
use std::path::PathBuf;

const RULES_HELP: &str = "\
Rule options (find, rget, rput), each negated by an `exclude-` prefix:
  --name=GLOB  --iname=GLOB          match the basename
  --re=REGEX   --ire=REGEX           search the basename
  --wholere=REGEX  --iwholere=REGEX  search the path relative to the root
  --min-size=SIZE  --max-size=SIZE   e.g. 100K, 1.5M, 2GiB (files only)
  --newer-than=TIME  --older-than=TIME  e.g. 2024-01-31, 3d, \"2 weeks ago\"
  --external-filter=COMMAND          sh -c COMMAND with the path as $1
An entry is selected when every rule matches and no exclude- rule does.";

#[derive(Debug, Parser)]
#[command(name = "fastdbfs", version, about = "Find and copy files on DBFS", after_help = RULES_HELP)]
pub struct Cli {
    /// Profile to connect with (defaults to `default_profile` from the configuration)
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    /// Configuration file to read instead of the default location
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// More log output; repeat for more
    #[arg(short = 'v', long = "log-verbose", action = clap::ArgAction::Count, global = true)]
    pub verbosity: u8,

    /// Rule options pulled out of the argument list before parsing.
    #[arg(skip)]
    pub rules: Vec<RuleSpec>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List a remote directory
    Ls {
        #[command(flatten)]
        listing: ListingArgs,
        path: Option<PathBuf>,
    },
    /// Create a remote directory and any missing parents
    Mkdir { path: PathBuf },
    /// Delete a remote file or directory
    Rm {
        /// Delete directories with everything in them
        #[arg(short = 'R', long)]
        recursive: bool,
        path: PathBuf,
    },
    /// Move or rename a remote file or directory
    Mv { from: PathBuf, to: PathBuf },
    /// Write a remote file to stdout
    Cat { path: PathBuf },
    /// Download one remote file
    Get {
        /// Replace an existing local file
        #[arg(short, long)]
        overwrite: bool,
        source: PathBuf,
        /// Local file or directory (defaults to the current directory)
        target: Option<PathBuf>,
    },
    /// Upload one local file
    Put {
        /// Replace an existing remote file
        #[arg(short, long)]
        overwrite: bool,
        source: PathBuf,
        /// Remote file or directory (defaults to the root)
        target: Option<PathBuf>,
    },
    /// Recursively list remote entries selected by rule options
    Find {
        /// Skip directories that cannot be listed instead of failing
        #[arg(long)]
        nowarn: bool,
        #[command(flatten)]
        listing: ListingArgs,
        path: Option<PathBuf>,
    },
    /// Recursively download a remote directory
    Rget {
        #[command(flatten)]
        copy: CopyArgs,
        source: PathBuf,
        /// Local directory (defaults to the source's name in the current directory)
        target: Option<PathBuf>,
    },
    /// Recursively upload a local directory
    Rput {
        #[command(flatten)]
        copy: CopyArgs,
        source: PathBuf,
        /// Remote directory (defaults to the source's name under the root)
        target: Option<PathBuf>,
    },
}
impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ls { .. } => "ls",
            Self::Mkdir { .. } => "mkdir",
            Self::Rm { .. } => "rm",
            Self::Mv { .. } => "mv",
            Self::Cat { .. } => "cat",
            Self::Get { .. } => "get",
            Self::Put { .. } => "put",
            Self::Find { .. } => "find",
            Self::Rget { .. } => "rget",
            Self::Rput { .. } => "rput",
        }
    }

    pub fn accepts_rules(&self) -> bool {
        matches!(self, Self::Find { .. } | Self::Rget { .. } | Self::Rput { .. })
    }
}

#[derive(Debug, Clone, Copy, Args)]
pub struct ListingArgs {
    /// Show type, size and modification time
    #[arg(short, long)]
    pub long: bool,
    /// Human readable sizes
    #[arg(short = 'H', long)]
    pub human: bool,
}

#[derive(Debug, Clone, Copy, Args)]
pub struct CopyArgs {
    /// Print every file as it is copied
    #[arg(long, conflicts_with = "nowarn")]
    pub verbose: bool,
    /// Skip directories that cannot be listed and keep quiet about conflicts
    #[arg(long)]
    pub nowarn: bool,
    /// Replace existing destination files
    #[arg(short, long)]
    pub overwrite: bool,
    /// Only copy files that are missing, differ in size, or are newer than the destination
    #[arg(long)]
    pub sync: bool,
    /// Stop at the first conflict
    #[arg(long)]
    pub strict: bool,
}

impl Cli {
    /// Parse the process arguments, pulling rule options out first.
    pub fn parse_with_rules() -> Self {
        let (args, rules) = split_rules(std::env::args_os());
        let mut cli = Self::parse_from(args);
        cli.rules = rules;
        cli
    }
}

/// Separate `--<rule>=VALUE` and `--<rule> VALUE` options from the rest.
///
/// clap cannot keep the relative order of different repeated options, and
/// rule order decides the order external commands run in, so rules are
/// collected by hand. Everything after a bare `--` is left alone.
pub fn split_rules(args: impl IntoIterator<Item = OsString>) -> (Vec<OsString>, Vec<RuleSpec>) {
    let names: Vec<String> = RuleKind::option_names().collect();
    let mut rest = Vec::new();
    let mut rules = Vec::new();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--" {
            rest.push(arg);
            rest.extend(args);
            break;
        }
        let Some(option) = arg.to_str().and_then(|a| a.strip_prefix("--")) else {
            rest.push(arg);
            continue;
        };
        let (name, value) = match option.split_once('=') {
            Some((name, value)) => (name, Some(value.to_string())),
            None => (option, None),
        };
        if !names.iter().any(|known| known == name) {
            rest.push(arg);
            continue;
        }
        match value.or_else(|| args.next().map(|v| v.to_string_lossy().into_owned())) {
            Some(value) => rules.push(RuleSpec::new(name, value)),
            // Let clap report the dangling option.
            None => rest.push(arg),
        }
    }
    (rest, rules)
}
