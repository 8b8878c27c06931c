//! The repo ↔ sysroot bridge: resolving a revision's boot checksum.

use crate::checksum::Checksum;
use crate::error::{Result, SysrootError};
use crate::repo::Repo;

/// Finds the kernel (and optional initramfs) file within a commit's root
/// tree. Standing in for the out-of-scope `get_kernel_from_tree` helper:
/// the low-level extraction logic lives outside this engine, but the
/// engine needs *some* implementation to make the bridge testable.
pub trait KernelLocator {
    /// Return `(kernel_file_name, initramfs_file_name)` found directly
    /// under the tree's `boot/` directory, if any. `initramfs` is `None`
    /// when the tree has a kernel but no initramfs.
    fn locate(&self, tree: &crate::repo::DirTreeObject, repo: &Repo) -> Result<Option<(String, Option<String>)>>;
}

/// Looks for `boot/vmlinuz-*` and `boot/initramfs-*` by filename
/// convention, matching the original `get_kernel_from_tree` helper's
/// contract.
#[derive(Debug, Default)]
pub struct ConventionalKernelLocator;

impl KernelLocator for ConventionalKernelLocator {
    fn locate(
        &self,
        tree: &crate::repo::DirTreeObject,
        repo: &Repo,
    ) -> Result<Option<(String, Option<String>)>> {
        let Some((_, boot_dirtree)) = tree.find_dir("boot") else {
            return Ok(None);
        };
        let boot_tree = repo.read_dirtree(boot_dirtree)?;
        let kernel = boot_tree
            .files_with_prefix("vmlinuz-")
            .first()
            .map(|(name, _)| name.to_string());
        let Some(kernel) = kernel else {
            return Ok(None);
        };
        let initramfs = boot_tree
            .files_with_prefix("initramfs-")
            .first()
            .map(|(name, _)| name.to_string());
        Ok(Some((kernel, initramfs)))
    }
}

/// Resolve the boot checksum for `revision`: the checksum of the
/// initramfs if present, else of the kernel.
pub fn bootcsum_for_revision(
    repo: &Repo,
    revision: &Checksum,
    locator: &dyn KernelLocator,
) -> Result<Checksum> {
    let tree = repo.read_commit_root(revision)?;
    let Some((_, boot_dirtree)) = tree.find_dir("boot") else {
        return Err(SysrootError::NotFound(format!(
            "commit {revision} has no /boot directory"
        )));
    };
    let boot_tree = repo.read_dirtree(boot_dirtree)?;
    let Some((kernel, initramfs)) = locator.locate(&tree, repo)? else {
        return Err(SysrootError::NotFound(format!(
            "commit {revision} has no kernel under /boot"
        )));
    };
    let chosen = initramfs.as_deref().unwrap_or(kernel.as_str());
    let csum = boot_tree.find_file(chosen).ok_or_else(|| {
        SysrootError::Assert(format!(
            "kernel locator returned {chosen:?} which is not in the boot tree"
        ))
    })?;
    Ok(csum.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{CommitObject, DirEntry, DirTreeObject};
    use cap_std_ext::cap_std;
    use cap_std_ext::cap_tempfile;

    fn new_repo() -> (cap_tempfile::TempDir, Repo) {
        let td = cap_tempfile::TempDir::new(cap_std::ambient_authority()).unwrap();
        let dir = td.open_dir(".").unwrap();
        let repo = Repo::open(dir, "/repo").unwrap();
        (td, repo)
    }

    fn make_commit(repo: &Repo, with_initramfs: bool) -> Checksum {
        let kernel_csum = repo
            .write_object(crate::checksum::ObjectKind::File, b"kernel bytes")
            .unwrap();
        let mut boot_entries = vec![DirEntry::File {
            name: "vmlinuz-6.1".into(),
            csum: kernel_csum,
        }];
        if with_initramfs {
            let initramfs_csum = repo
                .write_object(crate::checksum::ObjectKind::File, b"initramfs bytes")
                .unwrap();
            boot_entries.push(DirEntry::File {
                name: "initramfs-6.1".into(),
                csum: initramfs_csum,
            });
        }
        let boot_dirmeta = repo.write_object(crate::checksum::ObjectKind::DirMeta, b"{}").unwrap();
        let boot_dirtree = repo
            .write_dirtree(&DirTreeObject {
                entries: boot_entries,
            })
            .unwrap();
        let root_dirmeta = repo.write_object(crate::checksum::ObjectKind::DirMeta, b"{}").unwrap();
        let root_dirtree = repo
            .write_dirtree(&DirTreeObject {
                entries: vec![DirEntry::Dir {
                    name: "boot".into(),
                    dirtree: boot_dirtree,
                    dirmeta: boot_dirmeta,
                }],
            })
            .unwrap();
        repo.write_commit(&CommitObject {
            parent: None,
            root_dirtree,
            root_dirmeta,
            metadata: serde_json::json!({}),
        })
        .unwrap()
    }

    #[test]
    fn prefers_initramfs_when_present() {
        let (_td, repo) = new_repo();
        let commit = make_commit(&repo, true);
        let bootcsum = bootcsum_for_revision(&repo, &commit, &ConventionalKernelLocator).unwrap();
        let expected = Checksum::digest(b"initramfs bytes");
        assert_eq!(bootcsum, expected);
    }

    #[test]
    fn falls_back_to_kernel_without_initramfs() {
        let (_td, repo) = new_repo();
        let commit = make_commit(&repo, false);
        let bootcsum = bootcsum_for_revision(&repo, &commit, &ConventionalKernelLocator).unwrap();
        let expected = Checksum::digest(b"kernel bytes");
        assert_eq!(bootcsum, expected);
    }

    #[test]
    fn missing_boot_dir_is_not_found() {
        let (_td, repo) = new_repo();
        let root_dirmeta = repo.write_object(crate::checksum::ObjectKind::DirMeta, b"{}").unwrap();
        let root_dirtree = repo.write_dirtree(&DirTreeObject::default()).unwrap();
        let commit = repo
            .write_commit(&CommitObject {
                parent: None,
                root_dirtree,
                root_dirmeta,
                metadata: serde_json::json!({}),
            })
            .unwrap();
        assert!(matches!(
            bootcsum_for_revision(&repo, &commit, &ConventionalKernelLocator),
            Err(SysrootError::NotFound(_))
        ));
    }
}
