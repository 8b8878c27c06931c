//! The content-addressed repository object store.
//!
//! Covers ref listing, the transaction bracket, and reachability pruning.
//! The object writer underneath it is intentionally minimal — just enough
//! to make commits/trees/refs exercisable end-to-end in tests — since a
//! production-grade object encoding is an external collaborator's concern.

use crate::checksum::{object_path, Checksum, ObjectKind};
use crate::error::{Result, SysrootError};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Mutex;

/// The in-memory body of a commit object, serialized as JSON. A stand-in
/// for the real GVariant commit format: enough structure to let the repo
/// recurse through a tree for reachability and for `bootcsum_for_revision`
/// to read file content back out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitObject {
    /// The previous commit on this branch, if any.
    pub parent: Option<Checksum>,
    /// The root dirtree object for this commit's filesystem view.
    pub root_dirtree: Checksum,
    /// The root dirmeta object (permissions/xattrs) for the root directory.
    pub root_dirmeta: Checksum,
    /// Free-form commit metadata (subject, detached metadata, …).
    pub metadata: serde_json::Value,
}

/// A single entry in a [`DirTreeObject`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DirEntry {
    /// A regular file, by content checksum.
    File { name: String, csum: Checksum },
    /// A subdirectory: a (dirtree, dirmeta) pair.
    Dir {
        name: String,
        dirtree: Checksum,
        dirmeta: Checksum,
    },
}

/// The in-memory body of a dirtree object: the listing of one directory.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DirTreeObject {
    /// Children, in no particular order.
    pub entries: Vec<DirEntry>,
}

impl DirTreeObject {
    /// Look up an immediate child file by name.
    pub fn find_file(&self, name: &str) -> Option<&Checksum> {
        self.entries.iter().find_map(|e| match e {
            DirEntry::File { name: n, csum } if n == name => Some(csum),
            _ => None,
        })
    }

    /// List immediate child file names matching a glob-free prefix (used by
    /// `boot/vmlinuz-*` style lookups in the bootcsum bridge).
    pub fn files_with_prefix(&self, prefix: &str) -> Vec<(&str, &Checksum)> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                DirEntry::File { name, csum } if name.starts_with(prefix) => {
                    Some((name.as_str(), csum))
                }
                _ => None,
            })
            .collect()
    }

    /// Look up an immediate subdirectory by name.
    pub fn find_dir(&self, name: &str) -> Option<(&Checksum, &Checksum)> {
        self.entries.iter().find_map(|e| match e {
            DirEntry::Dir {
                name: n,
                dirtree,
                dirmeta,
            } if n == name => Some((dirtree, dirmeta)),
            _ => None,
        })
    }
}

/// Flags controlling [`Repo::prune`]. A closed enumeration, matching the
/// original `OstreeRepoPruneFlags` bitset but trimmed to the one mode this
/// engine uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneFlags {
    /// Restrict reachability roots to named refs (the only mode cleanup
    /// ever invokes `prune` with).
    pub refs_only: bool,
}

impl PruneFlags {
    /// The `REFS_ONLY` flag set.
    pub const REFS_ONLY: Self = Self { refs_only: true };
}

/// The result of a [`Repo::prune`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    /// Total objects examined.
    pub n_objects_total: u64,
    /// Objects that were unreachable and removed.
    pub n_objects_pruned: u64,
    /// Bytes freed by removing them.
    pub freed_bytes: u64,
}

/// Pending ref changes staged inside an open transaction. `None` stages a
/// deletion.
type PendingRefs = IndexMap<String, Option<Checksum>>;

enum TxnState {
    Closed,
    Open(PendingRefs),
}

/// A content-addressed object store plus ref namespace.
pub struct Repo {
    dir: Dir,
    /// Absolute-ish path, kept only for error messages.
    display_path: Utf8PathBuf,
    txn: Mutex<TxnState>,
    /// A layered repository consulted on lookup miss. Modeled as owned
    /// (rather than a true borrow) for lifetime simplicity, but the
    /// construction path guarantees it is never cyclic: see
    /// [`Repo::with_parent`].
    parent: Option<Box<Repo>>,
}

impl std::fmt::Debug for Repo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repo")
            .field("path", &self.display_path)
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

impl Repo {
    /// Open (creating if necessary) a repository rooted at `dir`.
    pub fn open(dir: Dir, display_path: impl Into<Utf8PathBuf>) -> Result<Self> {
        let display_path = display_path.into();
        dir.create_dir_all("objects")
            .map_err(|e| SysrootError::io(display_path.join("objects"), e))?;
        dir.create_dir_all("refs/heads")
            .map_err(|e| SysrootError::io(display_path.join("refs/heads"), e))?;
        Ok(Self {
            dir,
            display_path,
            txn: Mutex::new(TxnState::Closed),
            parent: None,
        })
    }

    /// Attach a layered parent repository, consulted when an object lookup
    /// misses locally. Rejects an attempt to create a cycle.
    pub fn with_parent(mut self, parent: Repo) -> Result<Self> {
        if parent.display_path == self.display_path {
            return Err(SysrootError::Assert(
                "a repo cannot be its own parent".into(),
            ));
        }
        self.parent = Some(Box::new(parent));
        Ok(self)
    }

    fn ref_path(name: &str) -> Utf8PathBuf {
        Utf8Path::new("refs/heads").join(name)
    }

    /// Enumerate refs whose name begins with `prefix`.
    pub fn list_refs(&self, prefix: &str) -> Result<IndexMap<String, Checksum>> {
        let mut out = IndexMap::new();
        if let Some(heads) = self
            .dir
            .open_dir_optional("refs/heads")
            .map_err(|e| SysrootError::io("refs/heads", e))?
        {
            Self::walk_refs(&heads, "", prefix, &mut out)?;
        }
        Ok(out)
    }

    fn walk_refs(
        dir: &Dir,
        path_prefix: &str,
        filter: &str,
        out: &mut IndexMap<String, Checksum>,
    ) -> Result<()> {
        for entry in dir
            .entries()
            .map_err(|e| SysrootError::io(path_prefix, e))?
        {
            let entry = entry.map_err(|e| SysrootError::io(path_prefix, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let full_name = if path_prefix.is_empty() {
                name.to_string()
            } else {
                format!("{path_prefix}/{name}")
            };
            let file_type = entry
                .file_type()
                .map_err(|e| SysrootError::io(&full_name, e))?;
            if file_type.is_dir() {
                let child = entry
                    .open_dir()
                    .map_err(|e| SysrootError::io(&full_name, e))?;
                Self::walk_refs(&child, &full_name, filter, out)?;
            } else if file_type.is_file() && full_name.starts_with(filter) {
                let content = dir
                    .read_to_string(&*name)
                    .map_err(|e| SysrootError::io(&full_name, e))?;
                let csum = Checksum::parse(content.trim_end())?;
                out.insert(full_name, csum);
            }
        }
        Ok(())
    }

    /// Read a single ref, if present.
    pub fn resolve_ref(&self, name: &str) -> Result<Option<Checksum>> {
        let path = Self::ref_path(name);
        match self.dir.read_to_string(&path) {
            Ok(content) => Ok(Some(Checksum::parse(content.trim_end())?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SysrootError::io(path, e)),
        }
    }

    /// Open a pending ref-update transaction. Fails if one is already open
    /// on this handle.
    pub fn begin_transaction(&self) -> Result<()> {
        let mut txn = self.txn.lock().unwrap();
        match &*txn {
            TxnState::Open(_) => Err(SysrootError::Transaction(
                "a transaction is already open on this repo handle".into(),
            )),
            TxnState::Closed => {
                *txn = TxnState::Open(IndexMap::new());
                Ok(())
            }
        }
    }

    /// Stage a ref create/update (`Some(csum)`) or delete (`None`). Multiple
    /// calls for the same name within one transaction are visible as a
    /// single step: the last call wins.
    pub fn set_refspec(&self, name: &str, csum: Option<Checksum>) -> Result<()> {
        let mut txn = self.txn.lock().unwrap();
        match &mut *txn {
            TxnState::Open(pending) => {
                pending.insert(name.to_owned(), csum);
                Ok(())
            }
            TxnState::Closed => Err(SysrootError::Transaction(
                "set_refspec called with no open transaction".into(),
            )),
        }
    }

    /// Atomically apply pending ref changes. On any error, pre-existing
    /// refs are left intact: validation happens before any write, so a
    /// rejected batch never touches disk.
    pub fn commit_transaction(&self) -> Result<()> {
        let pending = {
            let mut txn = self.txn.lock().unwrap();
            match std::mem::replace(&mut *txn, TxnState::Closed) {
                TxnState::Open(pending) => pending,
                TxnState::Closed => {
                    return Err(SysrootError::Transaction(
                        "commit_transaction called with no open transaction".into(),
                    ))
                }
            }
        };
        // Validate first: every path component must be a plausible ref
        // segment. This is the "on any error, leaves pre-existing refs
        // intact" guarantee — we never start writing until the whole batch
        // has passed validation.
        for name in pending.keys() {
            if name.is_empty() || name.starts_with('/') || name.contains("..") {
                return Err(SysrootError::Transaction(format!(
                    "refusing to commit invalid ref name {name:?}"
                )));
            }
        }
        for (name, csum) in &pending {
            let path = Self::ref_path(name);
            match csum {
                Some(csum) => {
                    if let Some(parent) = path.parent() {
                        self.dir
                            .create_dir_all(parent)
                            .map_err(|e| SysrootError::io(parent, e))?;
                    }
                    self.dir
                        .atomic_write(&path, format!("{csum}\n"))
                        .map_err(|e| SysrootError::io(&path, e))?;
                }
                None => {
                    self.dir
                        .remove_all_optional(&path)
                        .map_err(|e| SysrootError::io(&path, e))?;
                }
            }
        }
        Ok(())
    }

    /// Discard pending changes. Idempotent: safe to call with no
    /// transaction open, which lets cleanup unconditionally abort on every
    /// error exit.
    pub fn abort_transaction(&self) {
        let mut txn = self.txn.lock().unwrap();
        *txn = TxnState::Closed;
    }

    /// Write a content object, returning its checksum. `write_object` is
    /// the minimal object writer this engine owns; it is not a stand-in for
    /// a production-grade compressed/streaming writer.
    pub fn write_object(&self, kind: ObjectKind, data: &[u8]) -> Result<Checksum> {
        let csum = Checksum::digest(data);
        let path = object_path(&csum, kind);
        if let Some(parent) = path.parent() {
            self.dir
                .create_dir_all(parent)
                .map_err(|e| SysrootError::io(parent, e))?;
        }
        if !self
            .dir
            .try_exists(&path)
            .map_err(|e| SysrootError::io(&path, e))?
        {
            self.dir
                .atomic_write(&path, data)
                .map_err(|e| SysrootError::io(&path, e))?;
        }
        Ok(csum)
    }

    /// Read a raw object's bytes, consulting the parent repo on miss.
    pub fn read_object_bytes(&self, csum: &Checksum, kind: ObjectKind) -> Result<Vec<u8>> {
        let path = object_path(csum, kind);
        match self.dir.read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = &self.parent {
                    parent.read_object_bytes(csum, kind)
                } else {
                    Err(SysrootError::NotFound(format!(
                        "object {csum} ({:?}) not found",
                        kind
                    )))
                }
            }
            Err(e) => Err(SysrootError::io(path, e)),
        }
    }

    /// Write a commit object and return its checksum.
    pub fn write_commit(&self, commit: &CommitObject) -> Result<Checksum> {
        let data = serde_json::to_vec(commit)
            .map_err(|e| SysrootError::Invalid(format!("serializing commit: {e}")))?;
        self.write_object(ObjectKind::Commit, &data)
    }

    /// Read back a commit object by checksum.
    pub fn read_commit(&self, csum: &Checksum) -> Result<CommitObject> {
        let data = self.read_object_bytes(csum, ObjectKind::Commit)?;
        serde_json::from_slice(&data)
            .map_err(|e| SysrootError::Invalid(format!("corrupt commit object {csum}: {e}")))
    }

    /// Write a dirtree object and return its checksum.
    pub fn write_dirtree(&self, tree: &DirTreeObject) -> Result<Checksum> {
        let data = serde_json::to_vec(tree)
            .map_err(|e| SysrootError::Invalid(format!("serializing dirtree: {e}")))?;
        self.write_object(ObjectKind::DirTree, &data)
    }

    /// Read back a dirtree object by checksum.
    pub fn read_dirtree(&self, csum: &Checksum) -> Result<DirTreeObject> {
        let data = self.read_object_bytes(csum, ObjectKind::DirTree)?;
        serde_json::from_slice(&data)
            .map_err(|e| SysrootError::Invalid(format!("corrupt dirtree object {csum}: {e}")))
    }

    /// Resolve the commit at `revision` to its root dirtree, for path
    /// lookups (used by the bootcsum bridge).
    pub fn read_commit_root(&self, revision: &Checksum) -> Result<DirTreeObject> {
        let commit = self.read_commit(revision)?;
        self.read_dirtree(&commit.root_dirtree)
    }

    /// Garbage collect objects unreachable from any named ref.
    /// `flags.refs_only` is always `true` in this engine — it is the only
    /// mode cleanup invokes. `depth` is accepted for ostree interface
    /// fidelity; `0` (the only value cleanup passes) means "do not walk
    /// to parent commits", which is the only depth this engine
    /// implements.
    pub fn prune(&self, flags: PruneFlags, depth: i32) -> Result<PruneStats> {
        if !flags.refs_only {
            return Err(SysrootError::Prune(
                "only REFS_ONLY pruning is supported".into(),
            ));
        }
        let roots: Vec<Checksum> = self.list_refs("")?.into_values().collect();
        let reachable = self.compute_reachable(&roots, depth)?;

        let mut stats = PruneStats::default();
        let objects = self
            .dir
            .open_dir_optional("objects")
            .map_err(|e| SysrootError::io("objects", e))?;
        let Some(objects) = objects else {
            return Ok(stats);
        };
        for prefix_entry in objects.entries().map_err(|e| SysrootError::io("objects", e))? {
            let prefix_entry = prefix_entry.map_err(|e| SysrootError::io("objects", e))?;
            if !prefix_entry
                .file_type()
                .map_err(|e| SysrootError::io("objects", e))?
                .is_dir()
            {
                continue;
            }
            let prefix_name = prefix_entry.file_name();
            let prefix_name = prefix_name.to_string_lossy().to_string();
            let prefix_dir = prefix_entry
                .open_dir()
                .map_err(|e| SysrootError::io(&prefix_name, e))?;
            for obj_entry in prefix_dir
                .entries()
                .map_err(|e| SysrootError::io(&prefix_name, e))?
            {
                let obj_entry = obj_entry.map_err(|e| SysrootError::io(&prefix_name, e))?;
                let file_name = obj_entry.file_name();
                let file_name = file_name.to_string_lossy();
                let Some((rest, _ext)) = file_name.split_once('.') else {
                    continue;
                };
                let full_csum = format!("{prefix_name}{rest}");
                let Ok(csum) = Checksum::parse(&full_csum) else {
                    continue;
                };
                stats.n_objects_total += 1;
                if reachable.contains(&csum) {
                    continue;
                }
                let len = obj_entry
                    .metadata()
                    .map_err(|e| SysrootError::io(&full_csum, e))?
                    .len();
                prefix_dir
                    .remove_all_optional(&*file_name)
                    .map_err(|e| SysrootError::io(&full_csum, e))?;
                stats.n_objects_pruned += 1;
                stats.freed_bytes += len;
            }
        }
        Ok(stats)
    }

    fn compute_reachable(&self, roots: &[Checksum], depth: i32) -> Result<HashSet<Checksum>> {
        let mut reachable = HashSet::new();
        for root in roots {
            let mut next = Some(root.clone());
            let mut hops = 0;
            while let Some(commit_csum) = next {
                if reachable.contains(&commit_csum) {
                    break;
                }
                reachable.insert(commit_csum.clone());
                let commit = match self.read_commit(&commit_csum) {
                    Ok(c) => c,
                    Err(SysrootError::NotFound(_)) => break,
                    Err(e) => return Err(e),
                };
                reachable.insert(commit.root_dirtree.clone());
                reachable.insert(commit.root_dirmeta.clone());
                self.walk_dirtree(&commit.root_dirtree, &mut reachable)?;
                hops += 1;
                next = if depth < 0 || hops < depth {
                    commit.parent.clone()
                } else {
                    None
                };
            }
        }
        Ok(reachable)
    }

    fn walk_dirtree(&self, csum: &Checksum, reachable: &mut HashSet<Checksum>) -> Result<()> {
        let tree = self.read_dirtree(csum)?;
        for entry in &tree.entries {
            match entry {
                DirEntry::File { csum, .. } => {
                    reachable.insert(csum.clone());
                }
                DirEntry::Dir {
                    dirtree, dirmeta, ..
                } => {
                    if reachable.insert(dirtree.clone()) {
                        self.walk_dirtree(dirtree, reachable)?;
                    }
                    reachable.insert(dirmeta.clone());
                }
            }
        }
        Ok(())
    }
}

/// Open (ambient-authority) a repo directory at an absolute path, creating
/// the standard layout if missing.
pub fn open_at_path(path: &Utf8Path) -> Result<Repo> {
    std::fs::create_dir_all(path).map_err(|e| SysrootError::io(path, e))?;
    let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())
        .map_err(|e| SysrootError::io(path, e))?;
    Repo::open(dir, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cap_std_ext::cap_tempfile;

    fn new_repo() -> (cap_tempfile::TempDir, Repo) {
        let td = cap_tempfile::TempDir::new(cap_std::ambient_authority()).unwrap();
        let dir = td.open_dir(".").unwrap();
        let repo = Repo::open(dir, "/repo").unwrap();
        (td, repo)
    }

    fn csum(b: u8) -> Checksum {
        Checksum::parse(&(b as char).to_string().repeat(64)).unwrap()
    }

    #[test]
    fn set_and_commit_refspec() {
        let (_td, repo) = new_repo();
        repo.begin_transaction().unwrap();
        repo.set_refspec("ostree/0/0/0", Some(csum('a'))).unwrap();
        repo.commit_transaction().unwrap();
        let refs = repo.list_refs("ostree/0/0").unwrap();
        assert_eq!(refs.get("ostree/0/0/0"), Some(&csum('a')));
    }

    #[test]
    fn second_transaction_on_same_handle_rejected() {
        let (_td, repo) = new_repo();
        repo.begin_transaction().unwrap();
        assert!(repo.begin_transaction().is_err());
    }

    #[test]
    fn abort_is_idempotent_and_discards_pending() {
        let (_td, repo) = new_repo();
        repo.abort_transaction();
        repo.abort_transaction();
        repo.begin_transaction().unwrap();
        repo.set_refspec("a/b", Some(csum('a'))).unwrap();
        repo.abort_transaction();
        assert!(repo.list_refs("a").unwrap().is_empty());
    }

    #[test]
    fn uncommitted_transaction_leaves_refs_untouched() {
        let (_td, repo) = new_repo();
        repo.begin_transaction().unwrap();
        repo.set_refspec("ostree/0/0/0", Some(csum('a'))).unwrap();
        // Simulate a failure between set_refspec and commit_transaction: we
        // simply never call commit. No ref should exist.
        assert!(repo.list_refs("ostree").unwrap().is_empty());
    }

    #[test]
    fn delete_ref_via_null_refspec() {
        let (_td, repo) = new_repo();
        repo.begin_transaction().unwrap();
        repo.set_refspec("x/y", Some(csum('a'))).unwrap();
        repo.commit_transaction().unwrap();
        repo.begin_transaction().unwrap();
        repo.set_refspec("x/y", None).unwrap();
        repo.commit_transaction().unwrap();
        assert!(repo.list_refs("x").unwrap().is_empty());
    }

    #[test]
    fn cleanup_ref_prefix_leaves_no_refs_under_prefix() {
        let (_td, repo) = new_repo();
        repo.begin_transaction().unwrap();
        repo.set_refspec("ostree/1/0/0", Some(csum('a'))).unwrap();
        repo.set_refspec("ostree/1/0/1", Some(csum('b'))).unwrap();
        repo.commit_transaction().unwrap();

        let victims: Vec<String> = repo.list_refs("ostree/1/0").unwrap().into_keys().collect();
        repo.begin_transaction().unwrap();
        for name in &victims {
            repo.set_refspec(name, None).unwrap();
        }
        repo.commit_transaction().unwrap();
        assert!(repo.list_refs("ostree/1/0").unwrap().is_empty());
    }

    fn seed_commit(repo: &Repo, file_contents: &[u8]) -> Checksum {
        let file_csum = repo.write_object(ObjectKind::File, file_contents).unwrap();
        let dirmeta = repo
            .write_object(ObjectKind::DirMeta, b"{}")
            .unwrap();
        let tree = DirTreeObject {
            entries: vec![DirEntry::File {
                name: "vmlinuz-test".into(),
                csum: file_csum,
            }],
        };
        let root_dirtree = repo.write_dirtree(&tree).unwrap();
        let commit = CommitObject {
            parent: None,
            root_dirtree,
            root_dirmeta: dirmeta,
            metadata: serde_json::json!({}),
        };
        repo.write_commit(&commit).unwrap()
    }

    #[test]
    fn prune_keeps_reachable_removes_orphans() {
        let (_td, repo) = new_repo();
        let live = seed_commit(&repo, b"live kernel");
        let orphan = seed_commit(&repo, b"orphan kernel");
        repo.begin_transaction().unwrap();
        repo.set_refspec("ostree/0/0/0", Some(live.clone())).unwrap();
        repo.commit_transaction().unwrap();

        let stats = repo.prune(PruneFlags::REFS_ONLY, 0).unwrap();
        assert!(stats.n_objects_pruned > 0);
        assert!(stats.freed_bytes > 0);

        assert!(repo.read_commit(&live).is_ok());
        assert!(matches!(
            repo.read_commit(&orphan),
            Err(SysrootError::NotFound(_))
        ));
    }

    #[test]
    fn parent_repo_rejects_self_cycle() {
        let (_td, repo) = new_repo();
        let path = repo.display_path.clone();
        let other = Repo::open(
            Dir::open_ambient_dir(&path, cap_std::ambient_authority()).unwrap(),
            path,
        )
        .unwrap();
        assert!(repo.with_parent(other).is_err());
    }
}
