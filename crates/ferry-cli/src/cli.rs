use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "ferry",
    about = "ferry -- repository storage for database backups",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Config file (default: $FERRY_CONFIG, then /etc/ferry/ferry.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the configured repository path
    #[arg(long, global = true)]
    pub repo_path: Option<String>,

    /// Log level: error, warn, info, debug, trace
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// List entries below a repository path
    Ls(LsArgs),
    /// Show metadata of a repository path
    Info(InfoArgs),
    /// Write a repository file to stdout
    Get(GetArgs),
    /// Store a local file (or stdin) in the repository
    Put(PutArgs),
    /// Remove a repository file
    Rm(RmArgs),
    /// Create a repository path
    Mkdir(MkdirArgs),
    /// Remove a repository path
    Rmdir(RmdirArgs),
    /// Copy a repository file to another repository path
    Cp(CpArgs),
    /// Serve the repository over stdin/stdout for a remote driver
    Remote,
}

#[derive(Args)]
pub struct LsArgs {
    #[arg(default_value = "")]
    pub path: String,
    /// Regular expression entry names must match
    #[arg(long)]
    pub filter: Option<String>,
    #[arg(short, long)]
    pub recurse: bool,
}

#[derive(Args)]
pub struct InfoArgs {
    pub path: String,
    /// Report the link itself rather than its target
    #[arg(long)]
    pub no_follow: bool,
}

#[derive(Args)]
pub struct GetArgs {
    pub path: String,
    /// Succeed with no output when the file is missing
    #[arg(long)]
    pub ignore_missing: bool,
    /// Bytes to skip
    #[arg(long, default_value = "0")]
    pub offset: u64,
    /// Bytes to read
    #[arg(long)]
    pub limit: Option<u64>,
}

#[derive(Args)]
pub struct PutArgs {
    pub path: String,
    /// Local file to read; stdin when omitted
    pub source: Option<PathBuf>,
    /// Store without compression
    #[arg(long)]
    pub raw: bool,
}

#[derive(Args)]
pub struct RmArgs {
    pub path: String,
    /// Do not fail when the file is missing
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Args)]
pub struct MkdirArgs {
    pub path: String,
    /// Octal mode, e.g. 750
    #[arg(long)]
    pub mode: Option<String>,
    /// Create missing parents
    #[arg(short, long)]
    pub parents: bool,
}

#[derive(Args)]
pub struct RmdirArgs {
    pub path: String,
    #[arg(short, long)]
    pub recurse: bool,
}

#[derive(Args)]
pub struct CpArgs {
    pub from: String,
    pub to: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ls() {
        let cli = Cli::try_parse_from(["ferry", "ls", "archive", "--filter", "^0", "-r"]).unwrap();
        if let Command::Ls(args) = cli.command {
            assert_eq!(args.path, "archive");
            assert_eq!(args.filter.as_deref(), Some("^0"));
            assert!(args.recurse);
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_ls_default_path() {
        let cli = Cli::try_parse_from(["ferry", "ls"]).unwrap();
        if let Command::Ls(args) = cli.command {
            assert_eq!(args.path, "");
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_get_range() {
        let cli = Cli::try_parse_from(["ferry", "get", "f", "--offset", "10", "--limit", "5"]).unwrap();
        if let Command::Get(args) = cli.command {
            assert_eq!(args.offset, 10);
            assert_eq!(args.limit, Some(5));
            assert!(!args.ignore_missing);
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_put_stdin() {
        let cli = Cli::try_parse_from(["ferry", "put", "backup.info", "--raw"]).unwrap();
        if let Command::Put(args) = cli.command {
            assert!(args.source.is_none());
            assert!(args.raw);
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_remote_with_repo_path() {
        let cli = Cli::try_parse_from(["ferry", "remote", "--repo-path", "/srv/repo"]).unwrap();
        assert!(matches!(cli.command, Command::Remote));
        assert_eq!(cli.repo_path.as_deref(), Some("/srv/repo"));
    }

    #[test]
    fn parse_globals() {
        let cli = Cli::try_parse_from(["ferry", "--verbose", "--format", "json", "info", "x"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.format, OutputFormat::Json));
    }

    #[test]
    fn parse_mkdir_mode() {
        let cli = Cli::try_parse_from(["ferry", "mkdir", "spool", "--mode", "700", "-p"]).unwrap();
        if let Command::Mkdir(args) = cli.command {
            assert_eq!(args.mode.as_deref(), Some("700"));
            assert!(args.parents);
        } else { panic!("wrong command"); }
    }

    #[test]
    fn cp_needs_two_paths() {
        assert!(Cli::try_parse_from(["ferry", "cp", "a"]).is_err());
    }
}
