use clap::{CommandFactory as _, Parser as _};
use clap_complete::Shell;
use env_logger::{Builder, Env};
use patharg::OutputArg;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;
mod utils;
mod version;

use commands::*;
use utils::*;
use version::get_long_version;

/// Mount volume copies read-only and keep track of what was mounted.
#[derive(Clone, Debug, clap::Parser)]
#[command(version, long_version = get_long_version(), about)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Sets the output format.
    #[arg(
        global = true,
        short = 'F',
        long,
        default_value_t,
        env = "VCOPYMOUNT_FORMAT"
    )]
    format: OutputFormat,

    /// Increase verbosity (-v info, -vv debug, -vvv trace).
    #[arg(global = true, short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(flatten)]
    settings: SettingsArgs,
}

impl Cli {
    /// Match the command and run it.
    pub fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            Command::Mount(args) => args.run(&self.settings, self.format),
            Command::Umount(args) => args.run(&self.settings, self.format),
            Command::ClearResidue(args) => args.run(&self.settings, self.format),
            Command::Show(args) => args.run(self.format),
            Command::GenerateCompletion { shell, file } => {
                generate_completion(*shell, file.path_ref())
            }
        }
    }
}

/// Main commands of vcopymount.
#[derive(Clone, Debug, clap::Subcommand)]
pub enum Command {
    /// Assemble a block device from a volume copy and mount it read-only.
    Mount(mount::MountArgs),

    /// Unmount a volume copy and release its block devices.
    Umount(umount::UmountArgs),

    /// Release block devices, mounts and records left behind by interrupted operations.
    ClearResidue(residue::ClearResidueArgs),

    /// Print a mount record.
    Show(show::ShowArgs),

    /// Generate shell completion scripts.
    GenerateCompletion {
        /// The shell to generate the completion scripts for.
        shell: clap_complete::Shell,

        /// The file to write the completion scripts to or '-' to write to stdout.
        #[arg(short, long, default_value_t)]
        file: OutputArg,
    },
}

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    Builder::from_env(Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logger(cli.verbose);
    match cli.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

/// Generates shell completion scripts for the vcopymount command-line tool.
fn generate_completion(
    shell: Shell,
    path: Option<&PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("Generating completion file for {shell}...");
    let mut cmd = Cli::command();
    if let Some(file) = path {
        let mut file = File::create(file)?;
        clap_complete::generate(shell, &mut cmd, "vcopymount", &mut file);
    } else {
        clap_complete::generate(shell, &mut cmd, "vcopymount", &mut io::stdout());
    }
    Ok(())
}
