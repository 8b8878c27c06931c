//! `admin` — sysroot administration commands.
//!
//! `os-init` is grounded on `ot-admin-builtin-os-init.c`: it lays out the
//! per-osname `var` skeleton a deployment's `/var` bind-mounts onto.

use anyhow::{Context, Result};
use camino::Utf8Path;
use std::os::unix::fs::{symlink, DirBuilderExt};

/// Sysroot administration subcommands.
#[derive(Debug, clap::Subcommand)]
pub enum AdminCmd {
    /// Initialize the `var` skeleton for a new osname.
    OsInit {
        /// The osname (stateroot) to initialize.
        osname: String,
    },
}

pub fn run(sysroot: &Utf8Path, cmd: AdminCmd) -> Result<()> {
    match cmd {
        AdminCmd::OsInit { osname } => os_init(sysroot, &osname),
    }
}

fn os_init(sysroot: &Utf8Path, osname: &str) -> Result<()> {
    let os_dir = sysroot.join("ostree/deploy").join(osname);
    let var_dir = os_dir.join("var");

    std::fs::create_dir_all(&var_dir).with_context(|| format!("Creating {var_dir}"))?;

    let var_tmp = var_dir.join("tmp");
    std::fs::DirBuilder::new()
        .mode(0o1777)
        .recursive(true)
        .create(&var_tmp)
        .with_context(|| format!("Creating {var_tmp}"))?;

    let var_lib = var_dir.join("lib");
    std::fs::create_dir_all(&var_lib).with_context(|| format!("Creating {var_lib}"))?;

    let var_run = var_dir.join("run");
    if !var_run.as_std_path().exists() {
        symlink("../run", &var_run).with_context(|| format!("Symlinking {var_run}"))?;
    }

    let var_lock = var_dir.join("lock");
    if !var_lock.as_std_path().exists() {
        symlink("../run/lock", &var_lock).with_context(|| format!("Symlinking {var_lock}"))?;
    }

    tracing::info!("initialized osname {osname}");
    Ok(())
}
