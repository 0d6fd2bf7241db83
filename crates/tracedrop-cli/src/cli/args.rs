use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "tracedrop",
    version,
    about = "Validate, sign and submit recorded execution traces"
)]
pub struct Cli {
    /// Print every external command before running it
    #[arg(short = 'x', long, global = true)]
    pub echo_commands: bool,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate a signing key bound to cloud credentials
    Keygen(KeygenArgs),
    /// Validate, package, sign and upload a trace directory
    Upload(UploadArgs),
    /// Upload a package produced earlier with --defer
    UploadPackage(UploadPackageArgs),
}

#[derive(Args, Debug)]
pub struct KeygenArgs {
    /// Cloud credentials as <ACCESS_KEY_ID>,<SECRET>
    #[arg(value_name = "ACCESS_KEY_ID,SECRET")]
    pub credentials: String,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Provider {
    #[default]
    Aws,
    Gcloud,
}

/// Options shared by both upload commands.
#[derive(Args, Debug, Clone)]
pub struct TransportArgs {
    /// Object-store provider
    #[arg(long, value_enum, default_value_t = Provider::Aws, env = "TRACEDROP_PROVIDER")]
    pub provider: Provider,

    /// Use S3 transfer acceleration
    #[arg(long)]
    pub transfer_acceleration: bool,

    /// Extra metadata appended verbatim to the upload header
    #[arg(long, value_name = "K=V[,K=V...]", env = "TRACEDROP_EXTRA_METADATA")]
    pub extra_metadata: Option<String>,

    /// Title shown for the trace
    #[arg(long)]
    pub title: Option<String>,

    /// URL associated with the trace (bug report, CI run)
    #[arg(long)]
    pub url: Option<String>,
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    /// Trace directory produced by `rr record`
    #[arg(value_name = "TRACE_DIR")]
    pub trace_dir: PathBuf,

    #[command(flatten)]
    pub transport: TransportArgs,

    /// Package and sign, but write the package and its upload commands to
    /// PATH instead of transferring
    #[arg(long, visible_alias = "dry-run", value_name = "PATH")]
    pub defer: Option<PathBuf>,

    /// Number of validation problems to accept as warnings
    #[arg(long, default_value_t = 0, value_name = "N")]
    pub allow_warnings: u32,

    /// Accept the current privacy policy without prompting
    #[arg(long)]
    pub consent_to_current_privacy_policy: bool,

    /// Skip `rr pack` (trace already packed)
    #[arg(long)]
    pub no_pack: bool,

    /// Read trace metadata from this JSON file instead of `rr traceinfo`
    #[arg(long, value_name = "FILE")]
    pub trace_info: Option<PathBuf>,

    /// Sign with this EC private key PEM instead of the configured secret key
    #[arg(long, value_name = "FILE")]
    pub key_file: Option<PathBuf>,

    /// Upload without signing (no credential check, random address)
    #[arg(long, conflicts_with = "key_file")]
    pub unsigned: bool,
}

#[derive(Args, Debug)]
pub struct UploadPackageArgs {
    /// Package written by `upload --defer`
    #[arg(value_name = "PACKAGE")]
    pub package: PathBuf,

    #[command(flatten)]
    pub transport: TransportArgs,

    /// The package carries no signing trailer
    #[arg(long)]
    pub unsigned: bool,

    /// Rebuild the upload from local configuration even when the package's
    /// `.cmd` descriptor is present
    #[arg(long)]
    pub ignore_descriptor: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_dry_run_alias_and_global_echo() {
        let cli = Cli::parse_from([
            "tracedrop",
            "upload",
            "--dry-run",
            "/tmp/out",
            "--allow-warnings",
            "2",
            "-x",
            "/tmp/trace",
        ]);
        assert!(cli.echo_commands);
        match cli.cmd {
            Command::Upload(args) => {
                assert_eq!(args.defer, Some(PathBuf::from("/tmp/out")));
                assert_eq!(args.allow_warnings, 2);
                assert_eq!(args.transport.provider, Provider::Aws);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_upload_package_replays_descriptor_by_default() {
        let cli = Cli::parse_from(["tracedrop", "upload-package", "/tmp/dry-run"]);
        match cli.cmd {
            Command::UploadPackage(args) => {
                assert!(!args.ignore_descriptor);
                assert!(!args.unsigned);
                assert_eq!(args.package, PathBuf::from("/tmp/dry-run"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
