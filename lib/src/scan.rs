//! The deployment scanner: walks on-disk deployment directories and
//! constructs descriptors, independent of any sysroot's currently-active
//! list.

use crate::bootcsum::{bootcsum_for_revision, KernelLocator};
use crate::checksum::Checksum;
use crate::deployment::{parse_deployment_name, Deployment};
use crate::error::{Result, SysrootError};
use crate::repo::Repo;
use crate::sysroot::Sysroot;
use cap_std_ext::dirext::CapStdExtDirExt;
use camino::Utf8Path;

/// Enumerate children of `<osname>/deploy/`, constructing a descriptor for
/// each directory whose name parses as `<csum>.<serial>`. Other names are
/// silently skipped — the directory may legitimately hold staging
/// artifacts this engine does not own.
///
/// A deployment whose commit is missing from the repo is a hard error
/// rather than treated as an orphan to reclaim.
pub fn list_deployment_dirs_for_os(
    sysroot: &Sysroot,
    osname: &str,
    repo: &Repo,
    locator: &dyn KernelLocator,
) -> Result<Vec<Deployment>> {
    let deploy_path = Utf8Path::new("ostree/deploy").join(osname).join("deploy");
    let Some(dir) = sysroot
        .dir()
        .open_dir_optional(&deploy_path)
        .map_err(|e| SysrootError::io(&deploy_path, e))?
    else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for entry in dir.entries().map_err(|e| SysrootError::io(&deploy_path, e))? {
        let entry = entry.map_err(|e| SysrootError::io(&deploy_path, e))?;
        if !entry
            .file_type()
            .map_err(|e| SysrootError::io(&deploy_path, e))?
            .is_dir()
        {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let (csum, serial) = match parse_deployment_name(name) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let bootcsum = bootcsum_for_revision(repo, &csum, locator)?;
        out.push(Deployment::new(-1, osname, csum, serial, bootcsum, -1));
    }
    Ok(out)
}

/// Enumerate every osname under `ostree/deploy/`, calling
/// [`list_deployment_dirs_for_os`] on each.
pub fn list_all_deployment_dirs(
    sysroot: &Sysroot,
    repo: &Repo,
    locator: &dyn KernelLocator,
) -> Result<Vec<Deployment>> {
    let Some(dir) = sysroot
        .dir()
        .open_dir_optional("ostree/deploy")
        .map_err(|e| SysrootError::io("ostree/deploy", e))?
    else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for entry in dir.entries().map_err(|e| SysrootError::io("ostree/deploy", e))? {
        let entry = entry.map_err(|e| SysrootError::io("ostree/deploy", e))?;
        if !entry
            .file_type()
            .map_err(|e| SysrootError::io("ostree/deploy", e))?
            .is_dir()
        {
            continue;
        }
        let name = entry.file_name();
        let Some(osname) = name.to_str() else { continue };
        out.extend(list_deployment_dirs_for_os(sysroot, osname, repo, locator)?);
    }
    Ok(out)
}

/// A boot directory is named `<osname>-<bootcsum>`. Tolerant: returns
/// `None` on anything that doesn't parse, rather than erroring — contrast
/// [`crate::deployment::parse_deployment_name`], which is strict because
/// its caller has already filtered to entries it believes are deployments.
pub fn parse_bootdir_name(name: &str) -> Option<(&str, Checksum)> {
    let (osname, csum) = name.rsplit_once('-')?;
    let csum = Checksum::parse(csum).ok()?;
    Some((osname, csum))
}

/// Enumerate the directories under `boot/ostree/` whose name parses via
/// [`parse_bootdir_name`]; non-matching names are skipped, the same
/// conservative enumeration ostree's `list_all_boot_directories` does.
pub fn list_all_boot_directories(sysroot: &Sysroot) -> Result<Vec<String>> {
    let Some(dir) = sysroot
        .dir()
        .open_dir_optional("boot/ostree")
        .map_err(|e| SysrootError::io("boot/ostree", e))?
    else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for entry in dir.entries().map_err(|e| SysrootError::io("boot/ostree", e))? {
        let entry = entry.map_err(|e| SysrootError::io("boot/ostree", e))?;
        if !entry
            .file_type()
            .map_err(|e| SysrootError::io("boot/ostree", e))?
            .is_dir()
        {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if parse_bootdir_name(name).is_some() {
            out.push(name.to_owned());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bootdir_name_round_trip() {
        let csum = "a".repeat(64);
        let name = format!("myos-{csum}");
        let (osname, parsed) = parse_bootdir_name(&name).unwrap();
        assert_eq!(osname, "myos");
        assert_eq!(parsed.as_str(), csum);
    }

    #[test]
    fn parse_bootdir_name_rejects_non_checksum_suffix() {
        assert!(parse_bootdir_name("myos-notachecksum").is_none());
        assert!(parse_bootdir_name("nohyphen").is_none());
    }

    #[test]
    fn missing_deploy_dir_is_empty_not_error() {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap();
        let sysroot = Sysroot::open(path).unwrap();
        let repo = sysroot.get_repo().unwrap();
        let locator = crate::bootcsum::ConventionalKernelLocator;
        let result = list_deployment_dirs_for_os(&sysroot, "nope", repo, &locator).unwrap();
        assert!(result.is_empty());
        assert!(list_all_deployment_dirs(&sysroot, repo, &locator).unwrap().is_empty());
        assert!(list_all_boot_directories(&sysroot).unwrap().is_empty());
    }
}
