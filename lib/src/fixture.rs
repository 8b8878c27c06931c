//! Test suite fixture. Should only be used by this crate's own tests.
//!
//! Grounded on `ostree-ext`'s `fixture.rs`: a builder that assembles a
//! throwaway repo + sysroot tree so higher-level tests (the end-to-end
//! scenarios) don't each hand-roll commit/dirtree wiring.

#![allow(missing_docs)]

use crate::bootcsum::ConventionalKernelLocator;
use crate::checksum::{Checksum, ObjectKind};
use crate::deploy_primitive::{DeployPrimitive as _, LocalDeployPrimitive, OriginFile, TreeCheckout};
use crate::error::Result;
use crate::repo::{CommitObject, DirEntry, DirTreeObject};
use crate::sysroot::Sysroot;
use camino::Utf8Path;
use tempfile::TempDir;

/// A no-op tree checkout: creates the destination directory but stages no
/// file content. Sufficient for exercising the deployment/cleanup/apply
/// bookkeeping, which never reads deployment file contents.
pub struct NoopCheckout;

impl TreeCheckout for NoopCheckout {
    fn checkout(&self, _csum: &Checksum, dest: &Utf8Path) -> Result<()> {
        std::fs::create_dir_all(dest).map_err(|e| crate::error::SysrootError::io(dest, e))
    }
}

/// A throwaway sysroot with its repo, ready for deploys.
pub struct Fixture {
    _tempdir: TempDir,
    pub sysroot: Sysroot,
}

impl Fixture {
    /// Create a new, empty sysroot under a fresh temporary directory.
    pub fn new() -> Result<Self> {
        let tempdir = tempfile::tempdir().map_err(|e| crate::error::SysrootError::io("<tempdir>", e))?;
        let path = Utf8Path::from_path(tempdir.path())
            .expect("tempdir path is UTF-8")
            .to_owned();
        let mut sysroot = Sysroot::open(path)?;
        sysroot.load()?;
        Ok(Self {
            _tempdir: tempdir,
            sysroot,
        })
    }

    /// Write a new commit with a single kernel (and optional initramfs)
    /// under `/boot`, and one regular file `etc/os-release` with the given
    /// content — just enough tree shape for the bootcsum bridge and for
    /// distinguishing one commit's content from another's.
    pub fn commit(&self, kernel_version: &str, os_release: &str, with_initramfs: bool) -> Result<Checksum> {
        let repo = self.sysroot.get_repo()?;

        let kernel_csum = repo.write_object(ObjectKind::File, b"kernel bytes")?;
        let mut boot_entries = vec![DirEntry::File {
            name: format!("vmlinuz-{kernel_version}"),
            csum: kernel_csum,
        }];
        if with_initramfs {
            let initramfs_csum = repo.write_object(ObjectKind::File, b"initramfs bytes")?;
            boot_entries.push(DirEntry::File {
                name: format!("initramfs-{kernel_version}"),
                csum: initramfs_csum,
            });
        }
        let boot_dirmeta = repo.write_object(ObjectKind::DirMeta, b"{}")?;
        let boot_dirtree = repo.write_dirtree(&DirTreeObject {
            entries: boot_entries,
        })?;

        let os_release_csum = repo.write_object(ObjectKind::File, os_release.as_bytes())?;
        let etc_dirmeta = repo.write_object(ObjectKind::DirMeta, b"{}")?;
        let etc_dirtree = repo.write_dirtree(&DirTreeObject {
            entries: vec![DirEntry::File {
                name: "os-release".into(),
                csum: os_release_csum,
            }],
        })?;

        let root_dirmeta = repo.write_object(ObjectKind::DirMeta, b"{}")?;
        let root_dirtree = repo.write_dirtree(&DirTreeObject {
            entries: vec![
                DirEntry::Dir {
                    name: "boot".into(),
                    dirtree: boot_dirtree,
                    dirmeta: boot_dirmeta,
                },
                DirEntry::Dir {
                    name: "etc".into(),
                    dirtree: etc_dirtree,
                    dirmeta: etc_dirmeta,
                },
            ],
        })?;

        repo.write_commit(&CommitObject {
            parent: None,
            root_dirtree,
            root_dirmeta,
            metadata: serde_json::json!({ "version": kernel_version }),
        })
    }

    /// Deploy `csum` for `osname` using the no-op checkout and conventional
    /// kernel locator.
    pub fn deploy(&mut self, osname: &str, csum: &Checksum) -> Result<crate::deploy_primitive::DeployOutcome> {
        let checkout = NoopCheckout;
        let locator = ConventionalKernelLocator;
        let primitive = LocalDeployPrimitive::new(&checkout, &locator);
        let origin = OriginFile::with_refspec("exampleremote:examplebranch");
        let outcome = primitive.deploy(&self.sysroot, osname, csum, &origin)?;
        self.sysroot.load()?;
        Ok(outcome)
    }
}
