use async_recursion::async_recursion;
use log::{debug, info, warn};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

use crate::entry::{
    unix_timestamp, Entry, EntryAttr, EntryId, FlatRecord, FsStat, DEFAULT_FILE_MODE,
    EMPTY_CONTENT_REF, NAME_MAX,
};
use crate::entry_store::EntryStore;
use crate::error::{FsError, FsResult};
use crate::namespace::{split_parent, Namespace};

/// What to do with a store that fails validation at mount time. Some
/// deployments want a fresh empty namespace auto-created, others must fail
/// fast and leave the file untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryPolicy {
    Reject,
    Reinitialize,
}

/// The namespace service: path-addressed operations over the in-memory
/// mirror, with every mutation written to the entry store first and applied
/// to the cache only once the store write succeeded. The store is the source
/// of truth on (re)load; the cache is the source of truth for lookups.
#[derive(Clone)]
pub struct SqlfsService {
    store: EntryStore,
    namespace: Arc<RwLock<Namespace>>,
}

impl SqlfsService {
    /// Open and validate the store, then build the cache. A store that
    /// fails validation is either rejected or reformatted, per policy.
    pub async fn mount(db_path: impl AsRef<str>, policy: RecoveryPolicy) -> FsResult<Self> {
        let store = EntryStore::open(db_path.as_ref())?;

        if let Err(e) = store.validate().await {
            match policy {
                RecoveryPolicy::Reject => return Err(e),
                RecoveryPolicy::Reinitialize => {
                    warn!("store failed validation ({}), reinitializing", e);
                    store.init_schema().await?;
                }
            }
        }

        let namespace = Namespace::from_rows(store.select_all().await?)?;
        info!("mounted namespace with {} entries", namespace.len());
        Ok(Self {
            store,
            namespace: Arc::new(RwLock::new(namespace)),
        })
    }

    /// Reload the whole cache from the store. Used at mount and whenever an
    /// external writer reports a change; a full rebuild keeps the failure
    /// semantics simple (the old tree stays in place if the reload fails).
    pub async fn rebuild(&self) -> FsResult<()> {
        let namespace = Namespace::from_rows(self.store.select_all().await?)?;
        debug!("namespace cache rebuilt with {} entries", namespace.len());
        let mut guard = self
            .namespace
            .write()
            .map_err(|e| FsError::internal(format!("namespace lock poisoned: {}", e)))?;
        *guard = namespace;
        Ok(())
    }

    /// Spawn a task that rebuilds the cache on every remote-change
    /// notification. Full-tree invalidation, not an incremental patch.
    pub fn watch_remote_changes(&self, mut rx: mpsc::Receiver<()>) -> tokio::task::JoinHandle<()> {
        let svc = self.clone();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                match svc.rebuild().await {
                    Ok(()) => info!("remote change: namespace cache rebuilt"),
                    Err(e) => warn!("remote change: cache rebuild failed: {}", e),
                }
            }
        })
    }

    fn with_ns<T>(&self, f: impl FnOnce(&Namespace) -> FsResult<T>) -> FsResult<T> {
        let guard = self
            .namespace
            .read()
            .map_err(|e| FsError::internal(format!("namespace lock poisoned: {}", e)))?;
        f(&guard)
    }

    fn with_ns_mut<T>(&self, f: impl FnOnce(&mut Namespace) -> T) -> FsResult<T> {
        let mut guard = self
            .namespace
            .write()
            .map_err(|e| FsError::internal(format!("namespace lock poisoned: {}", e)))?;
        Ok(f(&mut guard))
    }

    /// Resolve an absolute path to a snapshot of its entry.
    pub fn resolve(&self, path: &str) -> FsResult<Entry> {
        self.with_ns(|ns| ns.resolve(path).cloned())
    }

    /// Existence-check variant of resolve.
    pub fn lookup(&self, path: &str) -> FsResult<Option<Entry>> {
        self.with_ns(|ns| Ok(ns.lookup(path)?.cloned()))
    }

    /// Reconstructed absolute path of an entry, if it is still in the tree.
    pub fn path_of(&self, id: EntryId) -> FsResult<Option<String>> {
        self.with_ns(|ns| Ok(ns.path_of(id)))
    }

    pub fn root_id(&self) -> FsResult<EntryId> {
        self.with_ns(|ns| Ok(ns.root_id()))
    }

    /// Update an entry's mtime, store first then cache.
    async fn touch_existing(&self, id: EntryId) -> FsResult<f64> {
        let now = unix_timestamp();
        self.store.update_mtime(id, now).await?;
        self.with_ns_mut(|ns| ns.set_mtime(id, now))?;
        Ok(now)
    }

    /// Create a new file entry with zero size and the empty-content
    /// reference. Fails if anything already exists at `path`.
    pub async fn create(&self, path: &str) -> FsResult<Entry> {
        debug!("create({})", path);
        self.register_file(path, 0, Some(EMPTY_CONTENT_REF.to_string()), DEFAULT_FILE_MODE)
            .await
    }

    /// Insert a file entry with explicit attributes. Backs both create and
    /// the bulk load path.
    pub async fn register_file(
        &self,
        path: &str,
        size: u64,
        content_ref: Option<String>,
        mode: u32,
    ) -> FsResult<Entry> {
        if self.lookup(path)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let (parent_path, name) = split_parent(path)?;
        validate_name(name)?;
        let parent = self.resolve(parent_path)?;
        if !parent.is_dir() {
            return Err(FsError::NotDirectory);
        }

        let mut entry = Entry::new_file(parent.id, name);
        entry.size = size;
        entry.content_ref = content_ref;
        entry.mode = mode;

        self.store.insert(entry.clone()).await?;
        self.with_ns_mut(|ns| ns.insert(entry.clone()))?;
        self.touch_existing(parent.id).await?;
        Ok(entry)
    }

    /// Update the entry's mtime, creating it as an empty file if absent.
    pub async fn touch(&self, path: &str) -> FsResult<Entry> {
        debug!("touch({})", path);
        match self.lookup(path)? {
            Some(mut entry) => {
                entry.modified_at = self.touch_existing(entry.id).await?;
                Ok(entry)
            }
            None => self.create(path).await,
        }
    }

    pub async fn mkdir(&self, path: &str) -> FsResult<Entry> {
        debug!("mkdir({})", path);
        if self.lookup(path)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let (parent_path, name) = split_parent(path)?;
        validate_name(name)?;
        let parent = self.resolve(parent_path)?;
        if !parent.is_dir() {
            return Err(FsError::NotDirectory);
        }

        let entry = Entry::new_dir(parent.id, name);
        self.store.insert(entry.clone()).await?;
        self.with_ns_mut(|ns| ns.insert(entry.clone()))?;
        self.touch_existing(parent.id).await?;
        Ok(entry)
    }

    /// Ensure `path` and every ancestor exist as directories, creating the
    /// missing ones top-down. An existing component of the wrong kind fails
    /// with NotDirectory; ancestors created before the failure stay in place.
    #[async_recursion]
    pub async fn mkdirp(&self, path: &str) -> FsResult<Entry> {
        if let Some(entry) = self.lookup(path)? {
            if !entry.is_dir() {
                return Err(FsError::NotDirectory);
            }
            return Ok(entry);
        }
        let (parent_path, _) = split_parent(path)?;
        self.mkdirp(parent_path).await?;
        self.mkdir(path).await
    }

    /// Move an entry. Renaming onto an existing file overwrites it (the
    /// destination row is deleted first, keeping (name, parent_id) unique);
    /// any collision involving a directory is rejected.
    pub async fn rename(&self, src: &str, dst: &str) -> FsResult<()> {
        debug!("rename({}, {})", src, dst);
        if src == dst {
            return Ok(());
        }
        let entry = self.resolve(src)?;
        if entry.is_root() {
            return Err(FsError::NotPermitted);
        }
        let (dst_parent_path, dst_name) = split_parent(dst)?;
        validate_name(dst_name)?;
        if entry.is_dir() && dst.starts_with(&format!("{}/", src)) {
            return Err(FsError::invalid_argument(
                "cannot move a directory into its own subtree",
            ));
        }
        let dst_parent = self.resolve(dst_parent_path)?;
        if !dst_parent.is_dir() {
            return Err(FsError::NotDirectory);
        }

        if let Some(existing) = self.lookup(dst)? {
            if existing.is_dir() {
                return Err(FsError::IsDirectory);
            }
            if entry.is_dir() {
                return Err(FsError::NotDirectory);
            }
            self.store.delete(existing.id).await?;
            self.with_ns_mut(|ns| ns.remove(existing.id))?;
        }

        self.store
            .relink(entry.id, dst_parent.id, dst_name.to_string())
            .await?;
        self.with_ns_mut(|ns| ns.relink(entry.id, dst_parent.id, dst_name))?;
        Ok(())
    }

    pub async fn unlink(&self, path: &str) -> FsResult<()> {
        debug!("unlink({})", path);
        let entry = self.resolve(path)?;
        if entry.is_dir() {
            return Err(FsError::IsDirectory);
        }
        self.store.delete(entry.id).await?;
        self.with_ns_mut(|ns| ns.remove(entry.id))?;
        self.touch_existing(entry.parent_id).await?;
        Ok(())
    }

    pub async fn rmdir(&self, path: &str) -> FsResult<()> {
        debug!("rmdir({})", path);
        let entry = self.resolve(path)?;
        if entry.is_root() {
            return Err(FsError::NotPermitted);
        }
        if !entry.is_dir() {
            return Err(FsError::NotDirectory);
        }
        if !entry.children.is_empty() {
            return Err(FsError::NotEmpty);
        }
        self.store.delete(entry.id).await?;
        self.with_ns_mut(|ns| ns.remove(entry.id))?;
        self.touch_existing(entry.parent_id).await?;
        Ok(())
    }

    /// Delete a whole subtree. Missing paths are a no-op, not an error; the
    /// root is never deleted. The store cascade removes descendant rows in
    /// one statement, the cache walks and drops the live subtree itself.
    pub async fn rmrf(&self, path: &str) -> FsResult<()> {
        debug!("rmrf({})", path);
        let Some(entry) = self.lookup(path)? else {
            return Ok(());
        };
        if entry.is_root() {
            return Err(FsError::NotPermitted);
        }
        self.store.delete(entry.id).await?;
        self.with_ns_mut(|ns| ns.remove_subtree(entry.id))?;
        self.touch_existing(entry.parent_id).await?;
        Ok(())
    }

    /// Child names of a directory, order not significant.
    pub fn readdir(&self, path: &str) -> FsResult<Vec<String>> {
        self.with_ns(|ns| {
            let entry = ns.resolve(path)?;
            if !entry.is_dir() {
                return Err(FsError::NotDirectory);
            }
            Ok(entry.children.keys().cloned().collect())
        })
    }

    pub fn getattr(&self, path: &str) -> FsResult<EntryAttr> {
        Ok(self.resolve(path)?.attr())
    }

    /// Fixed capacity figures plus a live entry count from the store.
    pub async fn statfs(&self) -> FsResult<FsStat> {
        const BSIZE: u64 = 1_000_000;
        const CAPACITY: u64 = 1 << 50;

        let files = self.store.count().await?;
        let blocks = CAPACITY / BSIZE;
        Ok(FsStat {
            bsize: BSIZE,
            frsize: BSIZE,
            blocks,
            bfree: blocks,
            bavail: blocks,
            files,
            ffree: 1_000_000,
            favail: 1_000_000,
            fsid: 1_000_000,
            flag: 1_000_000,
            namemax: NAME_MAX as u32,
        })
    }

    /// Flatten the namespace into interchange records, files only.
    pub fn serialize(&self) -> FsResult<Vec<FlatRecord>> {
        self.with_ns(|ns| Ok(ns.flatten(false)))
    }

    /// Like serialize, but directory entries are included too.
    pub fn serialize_with_dirs(&self) -> FsResult<Vec<FlatRecord>> {
        self.with_ns(|ns| Ok(ns.flatten(true)))
    }

    /// Import interchange records, creating every ancestor directory
    /// implicitly and inserting each record as a file.
    pub async fn load(&self, records: Vec<FlatRecord>) -> FsResult<()> {
        info!("loading {} records", records.len());
        for FlatRecord { path, size, content_ref, mode } in records {
            let (parent_path, _) = split_parent(&path)?;
            self.mkdirp(parent_path).await?;
            self.register_file(&path, size, content_ref, mode).await?;
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> FsResult<()> {
    if name.is_empty() {
        return Err(FsError::invalid_argument("empty entry name"));
    }
    if name.len() > NAME_MAX {
        return Err(FsError::invalid_argument(format!(
            "entry name longer than {} bytes",
            NAME_MAX
        )));
    }
    Ok(())
}
