//! The deploy primitive: materializes one new deployment on disk and
//! splices it into the active list. The actual content staging (checking
//! out a commit's tree into the deployment directory) is a trusted-callee
//! concern this crate does not own — see the [`DeployPrimitive`] trait
//! boundary.

use crate::bootcsum::{bootcsum_for_revision, KernelLocator};
use crate::checksum::Checksum;
use crate::deployment::Deployment;
use crate::error::Result;
use crate::sysroot::{BootPointer, Sysroot};
use cap_std_ext::dirext::CapStdExtDirExt;
use camino::Utf8PathBuf;

/// Key/value origin metadata recorded alongside a deployment, mirroring
/// the `.origin` side-file real ostree writes (`[origin] refspec=...`).
pub struct OriginFile(tini::Ini);

impl std::fmt::Debug for OriginFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("OriginFile").field(&self.to_string_contents()).finish()
    }
}

impl Default for OriginFile {
    fn default() -> Self {
        Self(tini::Ini::new())
    }
}

impl OriginFile {
    /// An origin recording a single refspec under `[origin]`.
    pub fn with_refspec(refspec: impl Into<String>) -> Self {
        Self(tini::Ini::new().section("origin").item("refspec", refspec.into()))
    }

    /// Parse origin contents already on disk.
    pub fn parse(contents: &str) -> Result<Self> {
        tini::Ini::from_string(contents)
            .map(Self)
            .map_err(|e| crate::error::SysrootError::Invalid(format!("invalid origin file: {e}")))
    }

    /// `[origin] refspec`, if set.
    pub fn refspec(&self) -> Option<String> {
        self.0.get("origin", "refspec")
    }

    /// Render as `.origin` file contents.
    pub fn to_string_contents(&self) -> String {
        self.0.to_string()
    }
}

/// What the deploy primitive needs to materialize a new deployment's
/// directory tree. Checking out a commit into a fresh directory is
/// orchestrated by a caller outside this crate; this trait is the seam.
pub trait TreeCheckout {
    /// Materialize `csum`'s tree at `dest`, a path relative to the
    /// sysroot root that does not yet exist.
    fn checkout(&self, csum: &Checksum, dest: &camino::Utf8Path) -> Result<()>;
}

/// The outcome of staging a new deployment: everything the caller needs to
/// decide whether (and how) to finalize the boot generation switch.
#[derive(Debug, Clone)]
pub struct DeployOutcome {
    /// The newly staged deployment, already placed at index 0.
    pub deployment: Deployment,
    /// The full renumbered active list for the new generation.
    pub deployments: Vec<Deployment>,
    /// The boot pointer the new generation was persisted under.
    pub boot: BootPointer,
}

/// Materializes one new deployment for `osname` from `csum`, with
/// `origin`, and splices it into the active list at index 0.
///
/// Implementations are expected to be the sole mutator of a given
/// sysroot's active list for the duration of the call (the caller —
/// [`crate::apply`] — holds the serialization lock).
pub trait DeployPrimitive {
    /// Stage `csum` as a new deployment for `osname`, write its origin,
    /// and persist the new active-deployment generation.
    fn deploy(
        &self,
        sysroot: &Sysroot,
        osname: &str,
        csum: &Checksum,
        origin: &OriginFile,
    ) -> Result<DeployOutcome>;
}

/// A [`DeployPrimitive`] that checks out trees via a caller-supplied
/// [`TreeCheckout`] and a kernel/initramfs convention via a caller-supplied
/// [`KernelLocator`].
pub struct LocalDeployPrimitive<'a> {
    checkout: &'a dyn TreeCheckout,
    locator: &'a dyn KernelLocator,
}

impl<'a> LocalDeployPrimitive<'a> {
    /// Construct a primitive using `checkout` to stage trees and `locator`
    /// to find the kernel/initramfs within them.
    pub fn new(checkout: &'a dyn TreeCheckout, locator: &'a dyn KernelLocator) -> Self {
        Self { checkout, locator }
    }
}

impl DeployPrimitive for LocalDeployPrimitive<'_> {
    fn deploy(
        &self,
        sysroot: &Sysroot,
        osname: &str,
        csum: &Checksum,
        origin: &OriginFile,
    ) -> Result<DeployOutcome> {
        let repo = sysroot.get_repo()?;
        let bootcsum = bootcsum_for_revision(repo, csum, self.locator)?;

        let existing_serials: Vec<u32> = sysroot
            .deployments()
            .iter()
            .filter(|d| d.osname == osname && &d.csum == csum)
            .map(|d| d.deploy_serial)
            .collect();
        let serial = existing_serials.iter().max().map_or(0, |s| s + 1);

        let new_deployment = Deployment::new(-1, osname, csum.clone(), serial, bootcsum.clone(), -1);

        let dirpath = sysroot.deployment_dirpath(&new_deployment);
        if let Some(parent) = dirpath.parent() {
            sysroot
                .dir()
                .create_dir_all(parent)
                .map_err(|e| crate::error::SysrootError::io(parent, e))?;
        }
        self.checkout.checkout(csum, &dirpath)?;

        let origin_relpath = sysroot.origin_relpath(&new_deployment);
        sysroot
            .dir()
            .atomic_write(&origin_relpath, origin.to_string_contents())
            .map_err(|e| crate::error::SysrootError::io(&origin_relpath, e))?;

        let boot_dir: Utf8PathBuf =
            Utf8PathBuf::from("boot/ostree").join(new_deployment.boot_dir_name());
        if sysroot
            .dir()
            .open_dir_optional(&boot_dir)
            .map_err(|e| crate::error::SysrootError::io(&boot_dir, e))?
            .is_none()
        {
            sysroot
                .dir()
                .create_dir_all(&boot_dir)
                .map_err(|e| crate::error::SysrootError::io(&boot_dir, e))?;
        }

        let deployments_in = sysroot.deployments();
        let boot_in = sysroot.boot();
        // The first deploy onto an otherwise-empty sysroot keeps bootversion
        // 0 rather than flipping, since there is no previous generation to
        // preserve for rollback.
        let new_bootversion = if deployments_in.is_empty() {
            boot_in.bootversion
        } else if boot_in.bootversion == 0 {
            1
        } else {
            0
        };
        let new_boot = BootPointer {
            bootversion: new_bootversion,
            subbootversion: 0,
        };

        let mut new_deployments = Vec::with_capacity(deployments_in.len() + 1);
        new_deployments.push(new_deployment.clone());
        new_deployments.extend(deployments_in.iter().cloned());
        for (i, d) in new_deployments.iter_mut().enumerate() {
            d.index = i as i32;
            d.bootserial = i as i32;
        }

        sysroot.persist_generation(new_boot, &new_deployments)?;

        let placed = new_deployments[0].clone();
        Ok(DeployOutcome {
            deployment: placed,
            deployments: new_deployments,
            boot: new_boot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootcsum::ConventionalKernelLocator;
    use crate::checksum::ObjectKind;
    use crate::repo::{CommitObject, DirEntry, DirTreeObject};
    use camino::Utf8Path;

    struct NoopCheckout;
    impl TreeCheckout for NoopCheckout {
        fn checkout(&self, _csum: &Checksum, dest: &camino::Utf8Path) -> Result<()> {
            // Real checkouts stage file content; this test only cares about
            // metadata bookkeeping, so just create the directory.
            std::fs::create_dir_all(dest)
                .map_err(|e| crate::error::SysrootError::io(dest, e))
        }
    }

    fn seed_commit(sysroot: &Sysroot) -> Checksum {
        let repo = sysroot.get_repo().unwrap();
        let kernel = repo.write_object(ObjectKind::File, b"kernel").unwrap();
        let boot_dirmeta = repo.write_object(ObjectKind::DirMeta, b"{}").unwrap();
        let boot_dirtree = repo
            .write_dirtree(&DirTreeObject {
                entries: vec![DirEntry::File {
                    name: "vmlinuz-1".into(),
                    csum: kernel,
                }],
            })
            .unwrap();
        let root_dirmeta = repo.write_object(ObjectKind::DirMeta, b"{}").unwrap();
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
    fn first_deploy_keeps_bootversion_and_places_at_index_zero() {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap();
        let mut sysroot = Sysroot::open(path).unwrap();
        sysroot.load().unwrap();
        let csum = seed_commit(&sysroot);

        let checkout = NoopCheckout;
        let locator = ConventionalKernelLocator;
        let primitive = LocalDeployPrimitive::new(&checkout, &locator);
        let origin = OriginFile::with_refspec("exampleremote:examplebranch");
        let outcome = primitive.deploy(&sysroot, "myos", &csum, &origin).unwrap();

        assert_eq!(outcome.boot.bootversion, 0);
        assert_eq!(outcome.deployment.index, 0);
        assert_eq!(outcome.deployment.deploy_serial, 0);
        assert_eq!(outcome.deployments.len(), 1);
    }

    #[test]
    fn second_deploy_flips_bootversion_and_prepends() {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap();
        let mut sysroot = Sysroot::open(path).unwrap();
        sysroot.load().unwrap();
        let csum_a = seed_commit(&sysroot);

        let checkout = NoopCheckout;
        let locator = ConventionalKernelLocator;
        let primitive = LocalDeployPrimitive::new(&checkout, &locator);
        let origin = OriginFile::with_refspec("r:b");
        primitive.deploy(&sysroot, "myos", &csum_a, &origin).unwrap();
        sysroot.load().unwrap();

        let csum_b = seed_commit(&sysroot);
        let outcome = primitive.deploy(&sysroot, "myos", &csum_b, &origin).unwrap();

        assert_eq!(outcome.boot.bootversion, 1);
        assert_eq!(outcome.deployments.len(), 2);
        assert_eq!(outcome.deployments[0].csum, csum_b);
        assert_eq!(outcome.deployments[0].index, 0);
        assert_eq!(outcome.deployments[1].index, 1);
    }
}
