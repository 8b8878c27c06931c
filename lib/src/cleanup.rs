//! The cleanup engine: deletes state left behind by partially completed
//! transactions and old boot generations, then regenerates the
//! per-deployment refs and prunes the repository.
//!
//! Grounded on `ostree-sysroot-cleanup.c`'s `_ostree_sysroot_piecemeal_cleanup`
//! and its four helpers (`cleanup_other_bootversions`,
//! `cleanup_old_deployments`, `generate_deployment_refs`, `prune_repo`); the
//! structure below mirrors that call order exactly.

use crate::error::{Result, SysrootError};
use crate::immutable;
use crate::scan;
use crate::sysroot::Sysroot;
use cap_std_ext::dirext::CapStdExtDirExt;
use camino::Utf8PathBuf;
use std::collections::HashSet;
use tracing::info;

bitflags::bitflags! {
    /// Which pieces of [`piecemeal_cleanup`] to run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CleanupFlags: u32 {
        /// Remove boot-loader and `ostree/boot.*` state for inactive boot
        /// generations.
        const BOOTVERSIONS = 1 << 0;
        /// Remove deployment directories (and boot directories) not
        /// referenced by the active list.
        const DEPLOYMENTS = 1 << 1;
        /// Run `repo.prune` with `REFS_ONLY` after ref regeneration.
        const PRUNE_REPO = 1 << 2;
    }
}

impl CleanupFlags {
    /// All three stages.
    pub const ALL: Self = Self::from_bits_truncate(
        Self::BOOTVERSIONS.bits() | Self::DEPLOYMENTS.bits() | Self::PRUNE_REPO.bits(),
    );
}

/// Equivalent to `ostree_sysroot_cleanup`: run every stage.
pub fn cleanup(sysroot: &Sysroot) -> Result<()> {
    piecemeal_cleanup(sysroot, CleanupFlags::ALL)
}

/// Equivalent to `ostree_sysroot_prepare_cleanup`: every stage except the
/// final repository prune.
pub fn prepare_cleanup(sysroot: &Sysroot) -> Result<()> {
    piecemeal_cleanup(sysroot, CleanupFlags::ALL - CleanupFlags::PRUNE_REPO)
}

/// Run the requested subset of cleanup stages against `sysroot`, which
/// must already be loaded.
pub fn piecemeal_cleanup(sysroot: &Sysroot, flags: CleanupFlags) -> Result<()> {
    if !sysroot.is_loaded() {
        return Err(SysrootError::WrongState("sysroot not loaded".into()));
    }

    if flags.contains(CleanupFlags::BOOTVERSIONS) {
        cleanup_other_bootversions(sysroot)?;
    }

    if flags.contains(CleanupFlags::DEPLOYMENTS) {
        cleanup_old_deployments(sysroot)?;
    }

    if !sysroot.deployments().is_empty() {
        let repo = sysroot.get_repo()?;
        generate_deployment_refs(sysroot, repo)?;

        if flags.contains(CleanupFlags::PRUNE_REPO) {
            prune_repo(repo)?;
        }
    }

    Ok(())
}

fn cleanup_other_bootversions(sysroot: &Sysroot) -> Result<()> {
    let boot = sysroot.boot();
    let cleanup_bv = if boot.bootversion == 0 { 1 } else { 0 };
    let cleanup_sbv = if boot.subbootversion == 0 { 1 } else { 0 };

    let paths = [
        Utf8PathBuf::from(format!("boot/loader.{cleanup_bv}")),
        Utf8PathBuf::from(format!("ostree/boot.{cleanup_bv}")),
        Utf8PathBuf::from(format!("ostree/boot.{cleanup_bv}.0")),
        Utf8PathBuf::from(format!("ostree/boot.{cleanup_bv}.1")),
        Utf8PathBuf::from(format!(
            "ostree/boot.{}.{}",
            boot.bootversion, cleanup_sbv
        )),
    ];
    for path in paths {
        sysroot
            .dir()
            .remove_all_optional(&path)
            .map_err(|e| SysrootError::io(&path, e))?;
    }
    Ok(())
}

fn cleanup_old_deployments(sysroot: &Sysroot) -> Result<()> {
    let root_stat = crate::sysroot::stat(camino::Utf8Path::new("/"))?;

    let active_dirs: HashSet<Utf8PathBuf> = sysroot
        .deployments()
        .iter()
        .map(|d| sysroot.deployment_dirpath(d))
        .collect();
    let active_bootcsums: HashSet<_> = sysroot
        .deployments()
        .iter()
        .map(|d| d.boot_csum.clone())
        .collect();

    let repo = sysroot.get_repo()?;
    let locator = crate::bootcsum::ConventionalKernelLocator;
    let all_deployment_dirs = scan::list_all_deployment_dirs(sysroot, repo, &locator)?;

    for d in &all_deployment_dirs {
        let dirpath = sysroot.deployment_dirpath(d);
        if active_dirs.contains(&dirpath) {
            continue;
        }
        let origin_relpath = sysroot.origin_relpath(d);

        let Some(deployment_dir) = sysroot
            .dir()
            .open_dir_optional(&dirpath)
            .map_err(|e| SysrootError::io(&dirpath, e))?
        else {
            continue;
        };
        let meta = deployment_dir
            .dir_metadata()
            .map_err(|e| SysrootError::io(&dirpath, e))?;

        // This shouldn't happen, because higher levels should disallow
        // having the booted deployment fall out of the active list, but
        // let's be extra safe.
        use rustix::fs::MetadataExt as _;
        if meta.dev() == root_stat.dev() && meta.ino() == root_stat.ino() {
            continue;
        }

        immutable::clear_immutable(&deployment_dir)?;
        drop(deployment_dir);

        sysroot
            .dir()
            .remove_all_optional(&dirpath)
            .map_err(|e| SysrootError::io(&dirpath, e))?;
        sysroot
            .dir()
            .remove_all_optional(&origin_relpath)
            .map_err(|e| SysrootError::io(&origin_relpath, e))?;
    }

    for name in scan::list_all_boot_directories(sysroot)? {
        let (_, bootcsum) = scan::parse_bootdir_name(&name).ok_or_else(|| {
            SysrootError::Assert(format!(
                "boot directory {name:?} passed enumeration but failed to parse"
            ))
        })?;
        if active_bootcsums.contains(&bootcsum) {
            continue;
        }
        let path = Utf8PathBuf::from("boot/ostree").join(&name);
        sysroot
            .dir()
            .remove_all_optional(&path)
            .map_err(|e| SysrootError::io(&path, e))?;
    }

    Ok(())
}

fn cleanup_ref_prefix(repo: &crate::repo::Repo, bootversion: u8, subbootversion: u8) -> Result<()> {
    let prefix = format!("ostree/{bootversion}/{subbootversion}");
    let refs = repo.list_refs(&prefix)?;

    repo.begin_transaction()?;
    for suffix in refs.keys() {
        let refname = format!("{prefix}/{suffix}");
        if let Err(e) = repo.set_refspec(&refname, None) {
            repo.abort_transaction();
            return Err(e);
        }
    }
    if let Err(e) = repo.commit_transaction() {
        repo.abort_transaction();
        return Err(e);
    }
    Ok(())
}

fn generate_deployment_refs(sysroot: &Sysroot, repo: &crate::repo::Repo) -> Result<()> {
    let boot = sysroot.boot();
    let cleanup_bv = if boot.bootversion == 0 { 1 } else { 0 };
    let cleanup_sbv = if boot.subbootversion == 0 { 1 } else { 0 };

    cleanup_ref_prefix(repo, cleanup_bv, 0)?;
    cleanup_ref_prefix(repo, cleanup_bv, 1)?;
    cleanup_ref_prefix(repo, boot.bootversion, cleanup_sbv)?;

    for (i, deployment) in sysroot.deployments().iter().enumerate() {
        let refname = format!("ostree/{}/{}/{}", boot.bootversion, boot.subbootversion, i);
        repo.begin_transaction()?;
        if let Err(e) = repo.set_refspec(&refname, Some(deployment.csum.clone())) {
            repo.abort_transaction();
            return Err(e);
        }
        if let Err(e) = repo.commit_transaction() {
            repo.abort_transaction();
            return Err(e);
        }
    }
    Ok(())
}

fn prune_repo(repo: &crate::repo::Repo) -> Result<()> {
    let stats = repo.prune(crate::repo::PruneFlags::REFS_ONLY, 0)?;
    if stats.freed_bytes > 0 {
        info!(freed_bytes = stats.freed_bytes, "pruned repository objects");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Checksum;
    use crate::deployment::Deployment;
    use camino::Utf8Path;

    fn csum(b: u8) -> Checksum {
        Checksum::parse(&(b as char).to_string().repeat(64)).unwrap()
    }

    #[test]
    fn cleanup_rejects_unloaded_sysroot() {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap();
        let sysroot = Sysroot::open(path).unwrap();
        assert!(matches!(
            piecemeal_cleanup(&sysroot, CleanupFlags::ALL),
            Err(SysrootError::WrongState(_))
        ));
    }

    #[test]
    fn cleanup_with_empty_sysroot_is_a_noop() {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap();
        let mut sysroot = Sysroot::open(path).unwrap();
        sysroot.load().unwrap();
        cleanup(&sysroot).unwrap();
        assert!(sysroot.deployments().is_empty());
    }

    #[test]
    fn generate_deployment_refs_one_per_index() {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap();
        let mut sysroot = Sysroot::open(path).unwrap();
        let d0 = Deployment::new(0, "x", csum(b'a'), 0, csum(b'k'), 0);
        let d1 = Deployment::new(1, "x", csum(b'b'), 0, csum(b'k'), 1);
        sysroot
            .persist_generation(sysroot.boot(), &[d0.clone(), d1.clone()])
            .unwrap();
        sysroot.load().unwrap();

        let repo = sysroot.get_repo().unwrap();
        repo.begin_transaction().unwrap();
        repo.set_refspec("ostree/0/0/0", Some(d0.csum.clone())).unwrap();
        repo.commit_transaction().unwrap();

        generate_deployment_refs(&sysroot, repo).unwrap();

        assert_eq!(repo.resolve_ref("ostree/0/0/0").unwrap(), Some(d0.csum));
        assert_eq!(repo.resolve_ref("ostree/0/0/1").unwrap(), Some(d1.csum));
    }
}
