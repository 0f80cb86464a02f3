//! Filesystem-backed object store for staging and frozen areas.
//!
//! Bytes live on the filesystem under `<data_root>/<project>+/` (staging)
//! and `<data_root>/<project>/` (frozen); node metadata (sizes, checksums,
//! persistent identifiers, timestamps) is tracked in a companion redb
//! database for fast stat and listing queries.
//!
//! All operations are blocking; async callers wrap them in
//! `tokio::task::spawn_blocking`.

mod checksum;
mod metadata;
mod types;

pub use checksum::{bare_digest, compute as compute_checksum, CHECKSUM_PREFIX};
pub use types::{Node, NodeKind, NodeMeta};

use anyhow::{Context, Result as AnyResult};
use chrono::Utc;
use redb::Database;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::constants::NODES_DB_FILENAME;
use crate::error::{Result, ServiceError};
use crate::pathname::Pathname;
use crate::scope::Area;

use metadata::{list_prefix, load_meta, reconcile, remove_meta, save_meta};
use types::NODES_TABLE;

/// Object store over the hierarchical backing storage.
///
/// `ObjectStore` is `Clone` and can be shared across threads; the underlying
/// database handles concurrent access safely. Mutual exclusion between
/// conflicting operations is the scope registry's job, not the store's.
#[derive(Clone)]
pub struct ObjectStore {
    data_root: PathBuf,
    db: Arc<Database>,
}

impl ObjectStore {
    /// Creates or opens the object store at the given data root.
    ///
    /// Reconciles node metadata against the filesystem on startup.
    ///
    /// # Errors
    ///
    /// Returns an error if the data root cannot be created or the metadata
    /// database cannot be opened or initialized.
    pub fn open<P: AsRef<Path>>(data_root: P) -> AnyResult<Self> {
        let data_root = data_root.as_ref().to_path_buf();

        fs::create_dir_all(&data_root)
            .with_context(|| format!("Failed to create data root: {}", data_root.display()))?;

        let db_path = data_root.join(NODES_DB_FILENAME);
        let db = Database::create(&db_path)
            .with_context(|| format!("Failed to open node metadata database: {}", db_path.display()))?;

        let write_txn = db
            .begin_write()
            .context("Failed to begin initialization transaction")?;
        {
            let _table = write_txn
                .open_table(NODES_TABLE)
                .context("Failed to initialize nodes table")?;
        }
        write_txn
            .commit()
            .context("Failed to commit initialization transaction")?;

        let store = Self {
            data_root,
            db: Arc::new(db),
        };

        store.reconcile()?;

        Ok(store)
    }

    /// Reconciles node metadata with actual filesystem state.
    pub fn reconcile(&self) -> AnyResult<()> {
        reconcile(&self.db, &self.data_root)
    }

    /// Creates the staging and frozen area directories for a project.
    pub fn ensure_project(&self, project: &str) -> Result<()> {
        for area in [Area::Staging, Area::Frozen] {
            let dir = self.data_root.join(area.dir_name(project));
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create area directory: {}", dir.display()))?;
        }
        Ok(())
    }

    /// Area-qualified metadata key for a pathname.
    fn key(&self, project: &str, area: Area, pathname: &Pathname) -> String {
        format!("{}{}", area.dir_name(project), pathname.as_str())
    }

    /// Filesystem location of a pathname within an area.
    fn fs_path(&self, project: &str, area: Area, pathname: &Pathname) -> PathBuf {
        self.data_root
            .join(area.dir_name(project))
            .join(pathname.relative())
    }

    /// Whether a node (file or folder) exists at the pathname.
    pub fn exists(&self, project: &str, area: Area, pathname: &Pathname) -> bool {
        self.fs_path(project, area, pathname).exists()
    }

    /// Stores a file in the staging area, overwriting any prior object.
    ///
    /// When `with_checksum` is false the node is stored without a digest
    /// and downstream validation falls back to size comparison.
    pub fn put(
        &self,
        project: &str,
        pathname: &Pathname,
        data: &[u8],
        content_type: Option<&str>,
        with_checksum: bool,
    ) -> Result<NodeMeta> {
        let file_path = self.fs_path(project, Area::Staging, pathname);

        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directories for: {pathname}"))?;
        }

        fs::write(&file_path, data)
            .with_context(|| format!("Failed to write object: {pathname}"))?;

        let content_type = content_type
            .map(std::string::ToString::to_string)
            .or_else(|| {
                mime_guess::from_path(&file_path)
                    .first()
                    .map(|mime| mime.to_string())
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let now = Utc::now();
        let meta = NodeMeta {
            pathname: pathname.as_str().to_string(),
            size: data.len() as u64,
            checksum: with_checksum.then(|| checksum::compute(data)),
            content_type,
            uploaded_at: now,
            modified_at: now,
            pid: None,
            frozen_at: None,
        };

        save_meta(&self.db, &self.key(project, Area::Staging, pathname), &meta)
            .map_err(ServiceError::Storage)?;

        Ok(meta)
    }

    /// Returns the node at the pathname, or `None` when absent.
    ///
    /// Folders are derived views: size is the sum of descendant file sizes
    /// and `contents` lists descendant file pathnames in order.
    pub fn stat(&self, project: &str, area: Area, pathname: &Pathname) -> Result<Option<Node>> {
        let fs_path = self.fs_path(project, area, pathname);

        if fs_path.is_file() {
            let key = self.key(project, area, pathname);
            let meta = match load_meta(&self.db, &key).map_err(ServiceError::Storage)? {
                Some(meta) => meta,
                None => self.reconstruct_meta(&fs_path, pathname)?,
            };
            return Ok(Some(Node::file(meta)));
        }

        if fs_path.is_dir() {
            let files = self.list(project, area, Some(pathname))?;
            let size = files.iter().map(|m| m.size).sum();
            let contents = files.into_iter().map(|m| m.pathname).collect();
            return Ok(Some(Node::folder(pathname.as_str().to_string(), size, contents)));
        }

        Ok(None)
    }

    /// Reads a file's bytes and metadata from an area, or `None` when the
    /// pathname does not name a file.
    pub fn read(
        &self,
        project: &str,
        area: Area,
        pathname: &Pathname,
    ) -> Result<Option<(NodeMeta, Vec<u8>)>> {
        let fs_path = self.fs_path(project, area, pathname);
        if !fs_path.is_file() {
            return Ok(None);
        }

        let key = self.key(project, area, pathname);
        let meta = match load_meta(&self.db, &key).map_err(ServiceError::Storage)? {
            Some(meta) => meta,
            None => self.reconstruct_meta(&fs_path, pathname)?,
        };
        let data = fs::read(&fs_path)
            .with_context(|| format!("Failed to read object: {pathname}"))?;
        Ok(Some((meta, data)))
    }

    /// Lists descendant file nodes of a pathname (or the whole area when
    /// `pathname` is `None`), sorted by pathname.
    pub fn list(
        &self,
        project: &str,
        area: Area,
        pathname: Option<&Pathname>,
    ) -> Result<Vec<NodeMeta>> {
        let prefix = match pathname {
            Some(p) => format!("{}{}/", area.dir_name(project), p.as_str()),
            None => format!("{}/", area.dir_name(project)),
        };
        let entries = list_prefix(&self.db, &prefix).map_err(ServiceError::Storage)?;
        Ok(entries.into_iter().map(|(_, meta)| meta).collect())
    }

    /// Deletes a file or folder subtree from an area.
    ///
    /// # Errors
    ///
    /// `NotFound` when the pathname does not exist in the area.
    pub fn delete(&self, project: &str, area: Area, pathname: &Pathname) -> Result<()> {
        let fs_path = self.fs_path(project, area, pathname);

        if fs_path.is_file() {
            fs::remove_file(&fs_path)
                .with_context(|| format!("Failed to delete object: {pathname}"))?;
            remove_meta(&self.db, &self.key(project, area, pathname))
                .map_err(ServiceError::Storage)?;
            return Ok(());
        }

        if fs_path.is_dir() {
            fs::remove_dir_all(&fs_path)
                .with_context(|| format!("Failed to delete folder: {pathname}"))?;
            let prefix = format!("{}{}/", area.dir_name(project), pathname.as_str());
            for (key, _) in list_prefix(&self.db, &prefix).map_err(ServiceError::Storage)? {
                remove_meta(&self.db, &key).map_err(ServiceError::Storage)?;
            }
            return Ok(());
        }

        Err(ServiceError::target_not_found())
    }

    /// Copies a file or folder subtree into the staging area.
    ///
    /// The source may be in either area; copies of frozen nodes become
    /// ordinary staging nodes (persistent identifiers are not carried
    /// over). Checksums and sizes are preserved exactly, zero-byte files
    /// included. All-or-nothing: a partially written destination is removed
    /// before the error is reported.
    ///
    /// # Errors
    ///
    /// `NotFound` when the source is absent; `Conflict` when the
    /// destination already exists.
    pub fn copy(
        &self,
        project: &str,
        src_area: Area,
        src: &Pathname,
        dst: &Pathname,
    ) -> Result<Vec<NodeMeta>> {
        let src_path = self.fs_path(project, src_area, src);
        let dst_path = self.fs_path(project, Area::Staging, dst);

        if !src_path.exists() {
            return Err(ServiceError::target_not_found());
        }
        if dst_path.exists() {
            return Err(ServiceError::target_exists());
        }

        if let Some(parent) = dst_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directories for: {dst}"))?;
        }

        if let Err(err) = copy_tree(&src_path, &dst_path) {
            // Leave no partial destination behind.
            if dst_path.is_dir() {
                let _ = fs::remove_dir_all(&dst_path);
            } else {
                let _ = fs::remove_file(&dst_path);
            }
            return Err(ServiceError::Storage(err));
        }

        self.remap_metadata(project, src_area, src, Area::Staging, dst, false, |meta| {
            meta.pid = None;
            meta.frozen_at = None;
            meta.modified_at = Utc::now();
        })
    }

    /// Moves or renames a file or folder subtree within the staging area.
    ///
    /// # Errors
    ///
    /// `NotFound` when the source is absent; `Conflict` when the
    /// destination already exists.
    pub fn move_staging(&self, project: &str, src: &Pathname, dst: &Pathname) -> Result<Vec<NodeMeta>> {
        self.move_tree(project, Area::Staging, src, Area::Staging, dst, |_| {})
    }

    /// Freezes a staging subtree: physically relocates it into the frozen
    /// area, assigning a persistent identifier and freeze timestamp to
    /// every contained file, and removing the source entirely.
    pub fn freeze(&self, project: &str, pathname: &Pathname) -> Result<Vec<NodeMeta>> {
        let now = Utc::now();
        self.move_tree(project, Area::Staging, pathname, Area::Frozen, pathname, move |meta| {
            meta.pid = Some(Uuid::new_v4().simple().to_string());
            meta.frozen_at = Some(now);
        })
    }

    /// Unfreezes a frozen subtree back into the staging area, clearing
    /// persistent identifiers and freeze timestamps.
    pub fn unfreeze(&self, project: &str, pathname: &Pathname) -> Result<Vec<NodeMeta>> {
        self.move_tree(project, Area::Frozen, pathname, Area::Staging, pathname, |meta| {
            meta.pid = None;
            meta.frozen_at = None;
        })
    }

    /// Relocates a subtree between areas, rewriting metadata keys and
    /// applying `transform` to each file's metadata. The filesystem rename
    /// is atomic for the whole subtree.
    fn move_tree(
        &self,
        project: &str,
        src_area: Area,
        src: &Pathname,
        dst_area: Area,
        dst: &Pathname,
        transform: impl Fn(&mut NodeMeta),
    ) -> Result<Vec<NodeMeta>> {
        let src_path = self.fs_path(project, src_area, src);
        let dst_path = self.fs_path(project, dst_area, dst);

        if !src_path.exists() {
            return Err(ServiceError::target_not_found());
        }
        if dst_path.exists() {
            return Err(ServiceError::target_exists());
        }

        if let Some(parent) = dst_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directories for: {dst}"))?;
        }

        fs::rename(&src_path, &dst_path)
            .with_context(|| format!("Failed to move {src} to {dst}"))?;

        self.remap_metadata(project, src_area, src, dst_area, dst, true, transform)
    }

    /// Rewrites metadata entries from a source subtree onto a destination
    /// subtree. Removes the source entries when `remove_src` is set.
    fn remap_metadata(
        &self,
        project: &str,
        src_area: Area,
        src: &Pathname,
        dst_area: Area,
        dst: &Pathname,
        remove_src: bool,
        transform: impl Fn(&mut NodeMeta),
    ) -> Result<Vec<NodeMeta>> {
        let src_file_key = self.key(project, src_area, src);
        let src_prefix = format!("{src_file_key}/");

        let mut entries = Vec::new();
        if let Some(meta) = load_meta(&self.db, &src_file_key).map_err(ServiceError::Storage)? {
            entries.push((src_file_key.clone(), meta));
        }
        entries.extend(list_prefix(&self.db, &src_prefix).map_err(ServiceError::Storage)?);

        let dst_dir = dst_area.dir_name(project);
        let mut moved = Vec::with_capacity(entries.len());

        for (old_key, mut meta) in entries {
            let new_pathname = format!("{}{}", dst.as_str(), &meta.pathname[src.as_str().len()..]);
            meta.pathname = new_pathname;
            transform(&mut meta);

            let new_key = format!("{dst_dir}{}", meta.pathname);
            save_meta(&self.db, &new_key, &meta).map_err(ServiceError::Storage)?;
            if remove_src {
                remove_meta(&self.db, &old_key).map_err(ServiceError::Storage)?;
            }
            moved.push(meta);
        }

        Ok(moved)
    }

    /// Rebuilds metadata for a file present on disk but missing from the
    /// database (e.g. placed there outside the service).
    fn reconstruct_meta(&self, fs_path: &Path, pathname: &Pathname) -> Result<NodeMeta> {
        let file_meta = fs::metadata(fs_path)
            .with_context(|| format!("Failed to get file metadata: {pathname}"))?;

        let content_type = mime_guess::from_path(fs_path).first().map_or_else(
            || "application/octet-stream".to_string(),
            |mime| mime.to_string(),
        );

        let now = Utc::now();
        Ok(NodeMeta {
            pathname: pathname.as_str().to_string(),
            size: file_meta.len(),
            checksum: None,
            content_type,
            uploaded_at: now,
            modified_at: now,
            pid: None,
            frozen_at: None,
        })
    }
}

/// Recursively copies a file or directory tree.
fn copy_tree(src: &Path, dst: &Path) -> AnyResult<()> {
    if src.is_file() {
        fs::copy(src, dst).with_context(|| format!("Failed to copy {}", src.display()))?;
        return Ok(());
    }

    fs::create_dir_all(dst).with_context(|| format!("Failed to create {}", dst.display()))?;
    for entry in
        fs::read_dir(src).with_context(|| format!("Failed to read directory: {}", src.display()))?
    {
        let entry = entry.context("Failed to read directory entry")?;
        let child_src = entry.path();
        let child_dst = dst.join(entry.file_name());
        copy_tree(&child_src, &child_dst)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_store() -> (ObjectStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = ObjectStore::open(tmp.path()).unwrap();
        store.ensure_project("demo").unwrap();
        (store, tmp)
    }

    fn path(s: &str) -> Pathname {
        Pathname::parse(s).unwrap()
    }

    #[test]
    fn put_and_stat_file() {
        let (store, _tmp) = create_store();

        let data = b"Hello, World!";
        let meta = store
            .put("demo", &path("/test/hello.txt"), data, Some("text/plain"), true)
            .unwrap();

        assert_eq!(meta.pathname, "/test/hello.txt");
        assert_eq!(meta.size, 13);
        assert_eq!(meta.content_type, "text/plain");
        assert_eq!(meta.checksum.as_deref(), Some(compute_checksum(data).as_str()));

        let node = store
            .stat("demo", Area::Staging, &path("/test/hello.txt"))
            .unwrap()
            .unwrap();
        assert_eq!(node.kind, NodeKind::File);
        assert_eq!(node.size, 13);
        assert!(node.pid.is_none());
    }

    #[test]
    fn put_without_checksum() {
        let (store, _tmp) = create_store();

        let meta = store
            .put("demo", &path("/nc/file.dat"), b"data", None, false)
            .unwrap();
        assert!(meta.checksum.is_none());
        assert_eq!(meta.size, 4);
    }

    #[test]
    fn stat_folder_sums_descendants() {
        let (store, _tmp) = create_store();

        store.put("demo", &path("/dir/a.txt"), b"aaaa", None, true).unwrap();
        store.put("demo", &path("/dir/sub/b.txt"), b"bb", None, true).unwrap();
        store.put("demo", &path("/dir/zero"), b"", None, true).unwrap();

        let node = store
            .stat("demo", Area::Staging, &path("/dir"))
            .unwrap()
            .unwrap();
        assert_eq!(node.kind, NodeKind::Folder);
        assert_eq!(node.size, 6);
        assert_eq!(
            node.contents,
            vec!["/dir/a.txt", "/dir/sub/b.txt", "/dir/zero"]
        );
    }

    #[test]
    fn stat_missing_is_none() {
        let (store, _tmp) = create_store();
        assert!(store
            .stat("demo", Area::Staging, &path("/nope"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn copy_preserves_zero_size_files() {
        let (store, _tmp) = create_store();

        store.put("demo", &path("/src/data.txt"), b"payload", None, true).unwrap();
        store.put("demo", &path("/src/zero"), b"", None, true).unwrap();

        let copied = store
            .copy("demo", Area::Staging, &path("/src"), &path("/dst"))
            .unwrap();
        assert_eq!(copied.len(), 2);

        let zero = store
            .stat("demo", Area::Staging, &path("/dst/zero"))
            .unwrap()
            .unwrap();
        assert_eq!(zero.size, 0);

        // Source unchanged.
        assert!(store.exists("demo", Area::Staging, &path("/src/data.txt")));
    }

    #[test]
    fn copy_to_existing_target_conflicts() {
        let (store, _tmp) = create_store();

        store.put("demo", &path("/a.txt"), b"a", None, true).unwrap();
        store.put("demo", &path("/b.txt"), b"b", None, true).unwrap();

        let err = store
            .copy("demo", Area::Staging, &path("/a.txt"), &path("/b.txt"))
            .unwrap_err();
        assert_eq!(err.to_string(), "Specified new target already exists");
    }

    #[test]
    fn copy_missing_source_not_found() {
        let (store, _tmp) = create_store();
        let err = store
            .copy("demo", Area::Staging, &path("/ghost"), &path("/copy"))
            .unwrap_err();
        assert_eq!(err.to_string(), "Specified target not found");
    }

    #[test]
    fn move_within_staging_rewrites_metadata() {
        let (store, _tmp) = create_store();

        store.put("demo", &path("/old/f.txt"), b"f", None, true).unwrap();
        store.move_staging("demo", &path("/old"), &path("/new")).unwrap();

        assert!(!store.exists("demo", Area::Staging, &path("/old")));
        let node = store
            .stat("demo", Area::Staging, &path("/new/f.txt"))
            .unwrap()
            .unwrap();
        assert_eq!(node.pathname, "/new/f.txt");
        assert_eq!(node.size, 1);
    }

    #[test]
    fn freeze_assigns_pids_and_removes_source() {
        let (store, _tmp) = create_store();

        store.put("demo", &path("/exp/a.dat"), b"12345", None, true).unwrap();
        store.put("demo", &path("/exp/zero"), b"", None, true).unwrap();

        let frozen = store.freeze("demo", &path("/exp")).unwrap();
        assert_eq!(frozen.len(), 2);
        assert!(frozen.iter().all(|m| m.pid.is_some() && m.frozen_at.is_some()));

        // No staging remnant.
        assert!(!store.exists("demo", Area::Staging, &path("/exp")));

        let node = store
            .stat("demo", Area::Frozen, &path("/exp/a.dat"))
            .unwrap()
            .unwrap();
        assert_eq!(node.size, 5);
        assert!(node.pid.is_some());
        assert!(node.frozen_at.is_some());
    }

    #[test]
    fn unfreeze_clears_pids() {
        let (store, _tmp) = create_store();

        store.put("demo", &path("/thaw/x"), b"x", None, true).unwrap();
        store.freeze("demo", &path("/thaw")).unwrap();
        store.unfreeze("demo", &path("/thaw")).unwrap();

        let node = store
            .stat("demo", Area::Staging, &path("/thaw/x"))
            .unwrap()
            .unwrap();
        assert!(node.pid.is_none());
        assert!(node.frozen_at.is_none());
    }

    #[test]
    fn copy_from_frozen_drops_pid() {
        let (store, _tmp) = create_store();

        store.put("demo", &path("/f/data"), b"data", None, true).unwrap();
        store.freeze("demo", &path("/f")).unwrap();

        store
            .copy("demo", Area::Frozen, &path("/f/data"), &path("/staged-copy"))
            .unwrap();

        let node = store
            .stat("demo", Area::Staging, &path("/staged-copy"))
            .unwrap()
            .unwrap();
        assert!(node.pid.is_none());
        assert_eq!(node.size, 4);
        // Frozen original untouched.
        assert!(store.exists("demo", Area::Frozen, &path("/f/data")));
    }

    #[test]
    fn delete_file_and_folder() {
        let (store, _tmp) = create_store();

        store.put("demo", &path("/del/a"), b"a", None, true).unwrap();
        store.put("demo", &path("/del/b"), b"b", None, true).unwrap();

        store.delete("demo", Area::Staging, &path("/del/a")).unwrap();
        assert!(!store.exists("demo", Area::Staging, &path("/del/a")));

        store.delete("demo", Area::Staging, &path("/del")).unwrap();
        assert!(store.list("demo", Area::Staging, Some(&path("/del"))).unwrap().is_empty());

        let err = store.delete("demo", Area::Staging, &path("/del")).unwrap_err();
        assert_eq!(err.to_string(), "Specified target not found");
    }

    #[test]
    fn list_area_inventory() {
        let (store, _tmp) = create_store();

        store.put("demo", &path("/inv/a"), b"a", None, true).unwrap();
        store.freeze("demo", &path("/inv")).unwrap();

        let frozen = store.list("demo", Area::Frozen, None).unwrap();
        assert_eq!(frozen.len(), 1);
        assert_eq!(frozen[0].pathname, "/inv/a");

        assert!(store.list("demo", Area::Staging, None).unwrap().is_empty());
    }

    #[test]
    fn overwrite_updates_checksum() {
        let (store, _tmp) = create_store();

        store.put("demo", &path("/ow.txt"), b"original", None, true).unwrap();
        let meta = store.put("demo", &path("/ow.txt"), b"updated", None, true).unwrap();

        assert_eq!(meta.size, 7);
        assert_eq!(meta.checksum.as_deref(), Some(compute_checksum(b"updated").as_str()));
    }
}
