//! The deployment descriptor.

use crate::checksum::Checksum;
use camino::Utf8PathBuf;

/// An immutable description of one OS deployment.
///
/// `(osname, csum, deploy_serial)` uniquely identifies a deployment on one
/// sysroot. Equality is structural on all six fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Deployment {
    /// Position in the active list for the current boot generation, or
    /// `-1` if this deployment is not (yet, or no longer) placed.
    pub index: i32,
    /// The stateroot / OS name this deployment belongs to.
    pub osname: String,
    /// The commit this deployment was deployed from.
    pub csum: Checksum,
    /// Disambiguates repeat deploys of the same commit.
    pub deploy_serial: u32,
    /// Checksum of the kernel (+ optional initramfs) this deployment boots.
    pub boot_csum: Checksum,
    /// Position inside its boot-entry group, or `-1` if unplaced.
    pub bootserial: i32,
}

impl Deployment {
    /// Construct a new descriptor. `index`/`bootserial` should be `-1` for
    /// deployments not yet placed in a sysroot's active list.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: i32,
        osname: impl Into<String>,
        csum: Checksum,
        deploy_serial: u32,
        boot_csum: Checksum,
        bootserial: i32,
    ) -> Self {
        Self {
            index,
            osname: osname.into(),
            csum,
            deploy_serial,
            boot_csum,
            bootserial,
        }
    }

    /// The on-disk directory name: `<csum>.<deploy_serial>`.
    pub fn dir_name(&self) -> String {
        format!("{}.{}", self.csum, self.deploy_serial)
    }

    /// The origin side-file name: `<csum>.<deploy_serial>.origin`.
    pub fn origin_name(&self) -> String {
        format!("{}.{}.origin", self.csum, self.deploy_serial)
    }

    /// `<osname>-<boot_csum>`, the boot directory name this deployment
    /// shares with every other deployment carrying the same boot checksum.
    pub fn boot_dir_name(&self) -> String {
        format!("{}-{}", self.osname, self.boot_csum)
    }

    /// Whether this descriptor has been placed into a sysroot's active list.
    pub fn is_placed(&self) -> bool {
        self.index >= 0
    }
}

/// A deployment name is `<csum>.<serial>`, a base-10 non-negative integer
/// suffix. Parse failure is a hard error here: callers have already
/// filtered to directory entries they believe are deployments (contrast
/// [`crate::scan::parse_bootdir_name`], which is tolerant).
pub fn parse_deployment_name(name: &str) -> crate::error::Result<(Checksum, u32)> {
    let (csum, serial) = name.rsplit_once('.').ok_or_else(|| {
        crate::error::SysrootError::Invalid(format!("deployment name {name:?} has no serial"))
    })?;
    let csum = Checksum::parse(csum)?;
    let serial: u32 = serial.parse().map_err(|_| {
        crate::error::SysrootError::Invalid(format!("deployment name {name:?} has non-numeric serial"))
    })?;
    Ok((csum, serial))
}

/// The path fragment (relative to a sysroot root) for a deployment's
/// on-disk directory, given its osname.
pub fn deployment_dir_fragment(osname: &str, dir_name: &str) -> Utf8PathBuf {
    Utf8PathBuf::from("ostree/deploy")
        .join(osname)
        .join("deploy")
        .join(dir_name)
}
