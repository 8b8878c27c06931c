//! # sysrootctl
//!
//! Command-line front end for the sysroot deployment engine. This crate
//! owns argument parsing and wires the `checkout`, `pull`, and `admin`
//! subcommands onto `sysroot-core`; network fetch and GPG verification
//! remain out of scope.

#![forbid(unused_must_use)]
#![deny(unsafe_code)]

mod commands;

use clap::Parser;

/// A content-addressed OS tree repository and deployment engine.
#[derive(Debug, Parser)]
#[command(name = "sysrootctl", version)]
struct Opt {
    /// Path to the sysroot root. Defaults to the current directory rather
    /// than `/`, since this tool is not assumed to be managing the running
    /// system.
    #[arg(long, global = true, default_value = ".")]
    sysroot: camino::Utf8PathBuf,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, clap::Subcommand)]
enum Cmd {
    /// Materialize a commit's tree at a destination path.
    Checkout(commands::checkout::CheckoutOpts),
    /// Pull a branch from a remote into the repository.
    Pull(commands::pull::PullOpts),
    /// Sysroot administration commands.
    #[command(subcommand)]
    Admin(commands::admin::AdminCmd),
}

async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let opt = Opt::parse();
    match opt.cmd {
        Cmd::Checkout(o) => commands::checkout::run(&opt.sysroot, o),
        Cmd::Pull(o) => commands::pull::run(&opt.sysroot, o),
        Cmd::Admin(o) => commands::admin::run(&opt.sysroot, o),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
