use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use transition_system::protocol::InvalidPackageName;
use transition_system::{logging, Bus, PackageRequest};

use pop_transition::config::ClientConfig;
use pop_transition::{Coordinator, Progress};

const DEFAULT_CONFIG: &str = "/etc/pop-transition/pop-transition.toml";

#[derive(Parser)]
#[command(version, about = "Remove Debian packages that were replaced by Flatpaks")]
struct Cli {
    /// Client configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Talk to a service on the session bus instead of the system bus.
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Remove the given Debian packages.
    Remove {
        #[arg(required = true, value_parser = parse_request)]
        packages: Vec<PackageRequest>,

        /// Flatpak installed in place of a removed package, listed in the summary.
        #[arg(long = "installed", value_name = "APP_ID")]
        installed: Vec<String>,
    },
    /// Stop the privileged service.
    Exit,
}

fn parse_request(name: &str) -> Result<PackageRequest, InvalidPackageName> {
    PackageRequest::new(name)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    logging::init();

    let cli = Cli::parse();
    let config = ClientConfig::load(&cli.config);
    let bus = if cli.session { Bus::Session } else { config.bus };

    let proxy = transition_system::connect(bus)
        .await
        .context("failed to connect to the transition service")?;

    match cli.command {
        Command::Exit => {
            proxy.exit().await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Remove {
            packages,
            installed,
        } => {
            let coordinator = Coordinator::new(Arc::new(proxy), config.retry_policy());
            let mut run = coordinator.spawn(packages);

            loop {
                tokio::select! {
                    progress = run.next_progress() => match progress {
                        Some(progress) => print_progress(&progress),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("Cancelling (only possible while waiting for the package lock)...");
                        run.cancel();
                    }
                }
            }

            let summary = run.finish().await;
            print!("{}", summary.report(&installed));

            Ok(if summary.error.is_some() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
    }
}

fn print_progress(progress: &Progress) {
    match progress {
        Progress::Waiting(package) => println!("{package}: waiting"),
        Progress::LockBusy => println!("Another package manager is running, waiting for it..."),
        Progress::Removing(package) => println!("{package}: removing"),
        Progress::Committing => println!("Applying changes..."),
    }
}
