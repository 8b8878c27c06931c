//! `checkout` — materialize a commit's tree at a destination path.
//!
//! Grounded on `ot-builtin-checkout.c`: `--from-stdin` reads `NUL`-separated
//! `(revision, subpath)` records terminated by an empty record;
//! `--atomic-retarget` stages at `DESTINATION-<csum>` and publishes by
//! swapping a sibling symlink. The staging symlink uses a random suffix
//! rather than a fixed name, so concurrent invocations can't collide.

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::io::Read;
use sysroot_core::checksum::{Checksum, ObjectKind};
use sysroot_core::repo::{self, DirEntry, Repo};

/// Options for `checkout`.
#[derive(Debug, clap::Args)]
pub struct CheckoutOpts {
    /// Check out as the invoking user rather than preserving ownership.
    #[arg(long)]
    user_mode: bool,

    /// Check out only this subpath of the tree.
    #[arg(long)]
    subpath: Option<Utf8PathBuf>,

    /// Union with an existing destination instead of requiring it be absent.
    #[arg(long)]
    union: bool,

    /// Stage at `DESTINATION-<csum>` and publish via a symlink swap.
    /// Mutually exclusive with `--from-stdin`.
    #[arg(long, conflicts_with = "from_stdin")]
    atomic_retarget: bool,

    /// Skip running any post-checkout triggers.
    #[arg(long)]
    no_triggers: bool,

    /// Read NUL-separated `(revision, subpath)` records from stdin,
    /// terminated by an empty record, instead of taking COMMIT/DESTINATION
    /// as arguments.
    #[arg(long)]
    from_stdin: bool,

    /// The commit to check out. Omitted when `--from-stdin` is given.
    commit: Option<String>,

    /// Where to materialize the tree. Omitted when `--from-stdin` is given.
    destination: Option<Utf8PathBuf>,
}

pub fn run(sysroot: &Utf8Path, opts: CheckoutOpts) -> Result<()> {
    let repo = open_repo(sysroot)?;

    if opts.no_triggers {
        tracing::debug!("triggers disabled for this checkout");
    }

    if opts.from_stdin {
        for (revision, subpath) in read_stdin_records()? {
            checkout_one(&repo, &revision, subpath.as_deref(), None, opts.union)?;
        }
        return Ok(());
    }

    let commit = opts.commit.context("COMMIT is required without --from-stdin")?;
    let destination = opts
        .destination
        .context("DESTINATION is required without --from-stdin")?;

    if opts.atomic_retarget {
        checkout_atomic_retarget(&repo, &commit, opts.subpath.as_deref(), &destination)
    } else {
        checkout_one(
            &repo,
            &commit,
            opts.subpath.as_deref(),
            Some(&destination),
            opts.union,
        )
    }
}

fn open_repo(sysroot: &Utf8Path) -> Result<Repo> {
    repo::open_at_path(&sysroot.join("ostree/repo")).context("Opening repository")
}

fn read_stdin_records() -> Result<Vec<(String, Option<Utf8PathBuf>)>> {
    let mut buf = Vec::new();
    std::io::stdin()
        .read_to_end(&mut buf)
        .context("Reading stdin")?;
    let mut out = Vec::new();
    for record in buf.split(|b| *b == 0) {
        if record.is_empty() {
            break;
        }
        let record = std::str::from_utf8(record).context("Non-UTF8 stdin record")?;
        let mut parts = record.splitn(2, ' ');
        let revision = parts.next().context("Empty stdin record")?.to_owned();
        let subpath = parts.next().filter(|s| !s.is_empty()).map(Utf8PathBuf::from);
        out.push((revision, subpath));
    }
    Ok(out)
}

fn checkout_one(
    repo: &Repo,
    revision: &str,
    subpath: Option<&Utf8Path>,
    destination: Option<&Utf8Path>,
    union: bool,
) -> Result<()> {
    let destination = destination.context("destination required")?;
    if !union && destination.exists() {
        bail!("{destination} already exists (pass --union to merge into it)");
    }
    let csum = Checksum::parse(revision).context("Parsing revision")?;
    let mut tree = repo.read_commit_root(&csum).context("Reading commit root")?;
    if let Some(subpath) = subpath {
        tree = descend(repo, &tree, subpath)?;
    }
    std::fs::create_dir_all(destination).with_context(|| format!("Creating {destination}"))?;
    materialize(repo, &tree, destination)
}

fn descend(repo: &Repo, tree: &sysroot_core::repo::DirTreeObject, subpath: &Utf8Path) -> Result<sysroot_core::repo::DirTreeObject> {
    let mut current = tree.clone();
    for component in subpath.components() {
        let name = component.as_str();
        let (dirtree, _dirmeta) = current
            .find_dir(name)
            .with_context(|| format!("Subpath component {name:?} not found"))?;
        current = repo.read_dirtree(dirtree)?;
    }
    Ok(current)
}

fn materialize(repo: &Repo, tree: &sysroot_core::repo::DirTreeObject, dest: &Utf8Path) -> Result<()> {
    for entry in &tree.entries {
        match entry {
            DirEntry::File { name, csum } => {
                let bytes = repo.read_object_bytes(csum, ObjectKind::File)?;
                std::fs::write(dest.join(name), bytes)
                    .with_context(|| format!("Writing {}", dest.join(name)))?;
            }
            DirEntry::Dir { name, dirtree, .. } => {
                let child_dest = dest.join(name);
                std::fs::create_dir_all(&child_dest)
                    .with_context(|| format!("Creating {child_dest}"))?;
                let child_tree = repo.read_dirtree(dirtree)?;
                materialize(repo, &child_tree, &child_dest)?;
            }
        }
    }
    Ok(())
}

fn checkout_atomic_retarget(
    repo: &Repo,
    revision: &str,
    subpath: Option<&Utf8Path>,
    destination: &Utf8Path,
) -> Result<()> {
    let csum = Checksum::parse(revision).context("Parsing revision")?;
    let staged = Utf8PathBuf::from(format!("{destination}-{csum}"));
    checkout_one(repo, revision, subpath, Some(&staged), false)?;

    let suffix = random_suffix();
    let link_path = Utf8PathBuf::from(format!("{destination}-link-{suffix}"));
    std::os::unix::fs::symlink(staged.file_name().unwrap(), &link_path)
        .with_context(|| format!("Creating staging symlink {link_path}"))?;
    std::fs::rename(&link_path, destination)
        .with_context(|| format!("Renaming {link_path} onto {destination}"))?;
    Ok(())
}

fn random_suffix() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{}-{:x}", std::process::id(), nanos)
}
