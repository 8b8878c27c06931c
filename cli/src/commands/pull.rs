//! `pull` — pull a branch from a remote into the repository.
//!
//! Network fetch and GPG verification are external collaborators this
//! crate does not implement; this subcommand parses the flags into the
//! bitset the core's pull contract expects, but the actual transfer is
//! left to a caller-supplied fetcher (there is none wired up here, so
//! this reports what it would have done rather than silently pretending
//! to succeed).

use anyhow::{bail, Result};
use bitflags::bitflags;
use camino::Utf8Path;

bitflags! {
    /// What kind of pull to perform.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct PullFlags: u32 {
        /// Only fetch metadata (commit objects), not file content.
        const METADATA = 1 << 0;
        /// Require and check a GPG signature on the fetched commit.
        const VERIFY = 1 << 1;
    }
}

/// Options for `pull`.
#[derive(Debug, clap::Args)]
pub struct PullOpts {
    /// Only fetch metadata.
    #[arg(short = 'm', long = "metadata-only")]
    metadata: bool,

    /// Verify the commit's GPG signature.
    #[arg(long)]
    verify_commits: bool,

    /// The remote name.
    remote: String,

    /// Branches to pull. Defaults to the remote's configured branches.
    branches: Vec<String>,
}

pub fn run(_sysroot: &Utf8Path, opts: PullOpts) -> Result<()> {
    let mut flags = PullFlags::empty();
    flags.set(PullFlags::METADATA, opts.metadata);
    flags.set(PullFlags::VERIFY, opts.verify_commits);

    bail!(
        "pull from {:?} branches={:?} flags={flags:?}: network fetch is not implemented by this engine; \
         wire a fetcher that implements the repo's object-writer trait boundary",
        opts.remote,
        opts.branches,
    )
}
