//! The sysroot model: loads and holds the active deployment list for the
//! current boot generation, and owns the filesystem root descriptor.

use crate::checksum::Checksum;
use crate::deployment::{deployment_dir_fragment, Deployment};
use crate::error::{Result, SysrootError};
use crate::repo::{self, Repo};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use std::sync::OnceLock;

/// The persisted pointer to the active boot generation. Real ostree derives
/// this from the `boot/loader` symlink target and the booted kernel
/// command line; since kernel-cmdline parsing is out of scope here (no
/// runtime configuration UI is a named non-goal), this engine persists the
/// equivalent state explicitly in `ostree/bootversion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootPointer {
    /// `0` or `1`.
    pub bootversion: u8,
    /// `0` or `1`.
    pub subbootversion: u8,
}

impl Default for BootPointer {
    fn default() -> Self {
        Self {
            bootversion: 0,
            subbootversion: 0,
        }
    }
}

/// The active-generation manifest stored under
/// `ostree/boot.<bv>.<sbv>/deployments`: one line per deployment, in
/// index order, `osname csum serial bootcsum`.
fn parse_manifest_line(line: &str) -> Result<Deployment> {
    let mut parts = line.split_whitespace();
    let osname = parts
        .next()
        .ok_or_else(|| SysrootError::Invalid(format!("empty manifest line {line:?}")))?;
    let csum = parts
        .next()
        .ok_or_else(|| SysrootError::Invalid(format!("manifest line missing csum {line:?}")))?;
    let serial = parts
        .next()
        .ok_or_else(|| SysrootError::Invalid(format!("manifest line missing serial {line:?}")))?;
    let bootcsum = parts.next().ok_or_else(|| {
        SysrootError::Invalid(format!("manifest line missing bootcsum {line:?}"))
    })?;
    Ok(Deployment::new(
        -1,
        osname,
        Checksum::parse(csum)?,
        serial
            .parse()
            .map_err(|_| SysrootError::Invalid(format!("bad serial in {line:?}")))?,
        Checksum::parse(bootcsum)?,
        -1,
    ))
}

fn manifest_line(d: &Deployment) -> String {
    format!("{} {} {} {}\n", d.osname, d.csum, d.deploy_serial, d.boot_csum)
}

/// A loaded sysroot: the active deployment list for the current boot
/// generation, plus enough filesystem access to act on it.
pub struct Sysroot {
    /// Absolute path to the sysroot root.
    pub path: Utf8PathBuf,
    /// A capability-scoped handle to [`Sysroot::path`].
    dir: Dir,
    boot: BootPointer,
    /// Smallest `index` first.
    deployments: Vec<Deployment>,
    loaded: bool,
    repo: OnceLock<Repo>,
}

impl std::fmt::Debug for Sysroot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sysroot")
            .field("path", &self.path)
            .field("boot", &self.boot)
            .field("deployments", &self.deployments)
            .field("loaded", &self.loaded)
            .finish()
    }
}

impl Sysroot {
    /// Open a sysroot directory without loading state yet.
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self> {
        let path = path.into();
        std::fs::create_dir_all(&path).map_err(|e| SysrootError::io(&path, e))?;
        let dir =
            Dir::open_ambient_dir(&path, cap_std::ambient_authority()).map_err(|e| SysrootError::io(&path, e))?;
        Ok(Self {
            path,
            dir,
            boot: BootPointer::default(),
            deployments: Vec::new(),
            loaded: false,
            repo: OnceLock::new(),
        })
    }

    /// The current boot-version pointer.
    pub fn boot(&self) -> BootPointer {
        self.boot
    }

    /// The active deployment list, smallest `index` first.
    pub fn deployments(&self) -> &[Deployment] {
        &self.deployments
    }

    /// Whether [`Sysroot::load`] has been called at least once.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// A capability-scoped handle onto the sysroot root, for callers (the
    /// scanner, the cleanup engine) that need direct filesystem access.
    pub fn dir(&self) -> &Dir {
        &self.dir
    }

    /// Read the current bootversion/subbootversion and the active
    /// deployment list for that generation, sorted by index. Any mutation
    /// made through the cleanup engine invalidates this snapshot; callers
    /// must call `load` again to see it.
    pub fn load(&mut self) -> Result<()> {
        self.boot = self.read_boot_pointer()?;
        let manifest_path = self.manifest_path(self.boot);
        let deployments = match self.dir.read_to_string(&manifest_path) {
            Ok(content) => content
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(parse_manifest_line)
                .collect::<Result<Vec<_>>>()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(SysrootError::io(&manifest_path, e)),
        };
        self.deployments = deployments
            .into_iter()
            .enumerate()
            .map(|(i, mut d)| {
                d.index = i as i32;
                d.bootserial = i as i32;
                d
            })
            .collect();
        self.loaded = true;
        Ok(())
    }

    fn read_boot_pointer(&self) -> Result<BootPointer> {
        match self.dir.read_to_string("ostree/bootversion") {
            Ok(content) => {
                let mut parts = content.split_whitespace();
                let bv: u8 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| SysrootError::Invalid("corrupt bootversion file".into()))?;
                let sbv: u8 = parts
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| SysrootError::Invalid("corrupt bootversion file".into()))?;
                Ok(BootPointer {
                    bootversion: bv,
                    subbootversion: sbv,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BootPointer::default()),
            Err(e) => Err(SysrootError::io("ostree/bootversion", e)),
        }
    }

    fn manifest_path(&self, boot: BootPointer) -> Utf8PathBuf {
        Utf8PathBuf::from(format!(
            "ostree/boot.{}.{}/deployments",
            boot.bootversion, boot.subbootversion
        ))
    }

    /// Persist a new boot pointer and active deployment list. Used by the
    /// deploy primitive and, implicitly, by cleanup's ref regeneration.
    pub fn persist_generation(&self, boot: BootPointer, deployments: &[Deployment]) -> Result<()> {
        let manifest_path = self.manifest_path(boot);
        if let Some(parent) = manifest_path.parent() {
            self.dir
                .create_dir_all(parent)
                .map_err(|e| SysrootError::io(parent, e))?;
        }
        let mut content = String::new();
        for d in deployments {
            content.push_str(&manifest_line(d));
        }
        self.dir
            .atomic_write(&manifest_path, content)
            .map_err(|e| SysrootError::io(&manifest_path, e))?;
        self.dir
            .atomic_write(
                "ostree/bootversion",
                format!("{} {}\n", boot.bootversion, boot.subbootversion),
            )
            .map_err(|e| SysrootError::io("ostree/bootversion", e))?;
        Ok(())
    }

    /// Lazily open (and cache) the repository under `<path>/ostree/repo`.
    pub fn get_repo(&self) -> Result<&Repo> {
        if let Some(r) = self.repo.get() {
            return Ok(r);
        }
        let repo_path = self.path.join("ostree/repo");
        let repo = repo::open_at_path(&repo_path)?;
        Ok(self.repo.get_or_init(|| repo))
    }

    /// The path fragment (relative to the sysroot root) for a deployment's
    /// on-disk directory.
    pub fn deployment_dirpath(&self, d: &Deployment) -> Utf8PathBuf {
        deployment_dir_fragment(&d.osname, &d.dir_name())
    }

    /// Same, suffixed with `.origin`.
    pub fn origin_relpath(&self, d: &Deployment) -> Utf8PathBuf {
        deployment_dir_fragment(&d.osname, &d.origin_name())
    }

    /// The booted deployment: the one whose on-disk root shares a
    /// `(dev, ino)` with `root`. The caller supplies which stat buffer
    /// counts as "`/`" rather than this engine reading the ambient root,
    /// so the check is meaningful on a sysroot that is not the running
    /// system's.
    pub fn booted_deployment(&self, root: &std::fs::Metadata) -> Result<Option<&Deployment>> {
        use rustix::fs::MetadataExt as _;
        for d in &self.deployments {
            let dirpath = self.deployment_dirpath(d);
            let Some(dir) = self
                .dir
                .open_dir_optional(&dirpath)
                .map_err(|e| SysrootError::io(&dirpath, e))?
            else {
                continue;
            };
            let meta = dir.dir_metadata().map_err(|e| SysrootError::io(&dirpath, e))?;
            if meta.dev() == root.dev() && meta.ino() == root.ino() {
                return Ok(Some(d));
            }
        }
        Ok(None)
    }

    /// The merge deployment for `osname`: the currently active deployment
    /// under that osname with the smallest index (i.e. the one a new
    /// deploy's origin should be seeded from).
    pub fn merge_deployment(&self, osname: &str) -> Option<&Deployment> {
        self.deployments.iter().find(|d| d.osname == osname)
    }
}

/// Stat `path` for use with [`Sysroot::booted_deployment`].
pub fn stat(path: &Utf8Path) -> Result<std::fs::Metadata> {
    std::fs::metadata(path).map_err(|e| SysrootError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Checksum;

    fn csum(b: u8) -> Checksum {
        Checksum::parse(&(b as char).to_string().repeat(64)).unwrap()
    }

    #[test]
    fn load_empty_sysroot_has_no_deployments() {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap();
        let mut sysroot = Sysroot::open(path).unwrap();
        sysroot.load().unwrap();
        assert!(sysroot.deployments().is_empty());
        assert_eq!(sysroot.boot(), BootPointer::default());
    }

    #[test]
    fn persist_then_load_round_trips_contiguous_indices() {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap();
        let mut sysroot = Sysroot::open(path).unwrap();
        let d0 = Deployment::new(-1, "x", csum('a'), 0, csum('k'), -1);
        let d1 = Deployment::new(-1, "x", csum('b'), 0, csum('k'), -1);
        sysroot
            .persist_generation(BootPointer::default(), &[d0, d1])
            .unwrap();
        sysroot.load().unwrap();
        let deployments = sysroot.deployments();
        assert_eq!(deployments.len(), 2);
        for (i, d) in deployments.iter().enumerate() {
            assert_eq!(d.index, i as i32);
        }
    }

    #[test]
    fn deployment_dirpath_matches_spec_layout() {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap();
        let sysroot = Sysroot::open(path).unwrap();
        let d = Deployment::new(0, "myos", csum('a'), 3, csum('k'), 0);
        assert_eq!(
            sysroot.deployment_dirpath(&d),
            Utf8PathBuf::from(format!("ostree/deploy/myos/deploy/{}.3", "a".repeat(64)))
        );
        assert_eq!(
            sysroot.origin_relpath(&d),
            Utf8PathBuf::from(format!("ostree/deploy/myos/deploy/{}.3.origin", "a".repeat(64)))
        );
    }
}
