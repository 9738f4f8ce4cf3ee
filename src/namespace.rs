use log::debug;
use std::collections::HashMap;

use crate::entry::{Entry, EntryId, FlatRecord};
use crate::error::{FsError, FsResult};

/// Split an absolute path into name segments. Only the empty segment
/// created by the leading `/` is dropped; interior or trailing empty
/// segments are looked up literally and fail resolution.
pub(crate) fn split_path(path: &str) -> FsResult<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(FsError::invalid_argument(format!(
            "path is not absolute: {:?}",
            path
        )));
    }
    if path == "/" {
        return Ok(Vec::new());
    }
    Ok(path[1..].split('/').collect())
}

/// Split an absolute path into (parent path, entry name).
pub(crate) fn split_parent(path: &str) -> FsResult<(&str, &str)> {
    if !path.starts_with('/') {
        return Err(FsError::invalid_argument(format!(
            "path is not absolute: {:?}",
            path
        )));
    }
    if path == "/" {
        return Err(FsError::invalid_argument("root has no parent"));
    }
    let idx = path.rfind('/').unwrap_or(0);
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Ok((parent, &path[idx + 1..]))
}

/// In-memory mirror of the entries table: an arena of entries indexed by id,
/// with the root id pinned at rebuild time. Directories reference children
/// by id through their name-indexed maps, so lookups are O(path depth).
///
/// The namespace never writes to the store; SqlfsService mirrors every
/// successful store write into it.
pub struct Namespace {
    entries: HashMap<EntryId, Entry>,
    root_id: EntryId,
}

impl Namespace {
    /// Rebuild the tree from a full table scan. First pass indexes rows by
    /// id and pins the single self-referencing root; second pass wires each
    /// entry into its parent's children map. Any row that cannot be wired
    /// makes the whole cache unusable, it is never silently dropped.
    pub fn from_rows(rows: Vec<Entry>) -> FsResult<Self> {
        let mut entries = HashMap::with_capacity(rows.len());
        let mut root_id: Option<EntryId> = None;

        for row in rows {
            if row.is_root() {
                if root_id.replace(row.id).is_some() {
                    return Err(FsError::corrupted("more than one self-referencing root"));
                }
            }
            entries.insert(row.id, row);
        }

        let root_id = root_id.ok_or_else(|| FsError::corrupted("no self-referencing root"))?;

        let edges: Vec<(EntryId, EntryId, String)> = entries
            .values()
            .filter(|e| !e.is_root())
            .map(|e| (e.id, e.parent_id, e.name.clone()))
            .collect();

        for (id, parent_id, name) in edges {
            let parent = entries.get_mut(&parent_id).ok_or_else(|| {
                FsError::corrupted(format!("entry {} references missing parent {}", id, parent_id))
            })?;
            parent.children.insert(name, id);
        }

        debug!("namespace rebuilt: {} entries", entries.len());
        Ok(Self { entries, root_id })
    }

    pub fn root_id(&self) -> EntryId {
        self.root_id
    }

    pub fn get(&self, id: EntryId) -> Option<&Entry> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve an absolute path to an entry, one name lookup per segment.
    /// Fails with NotFound at the first unresolved segment; the error does
    /// not say how far resolution got (ENOENT semantics).
    pub fn resolve(&self, path: &str) -> FsResult<&Entry> {
        let segments = split_path(path)?;
        let mut node = self
            .entries
            .get(&self.root_id)
            .ok_or_else(|| FsError::internal("root entry missing from arena"))?;
        for part in segments {
            let child_id = node.children.get(part).ok_or(FsError::NotFound)?;
            node = self.entries.get(child_id).ok_or(FsError::NotFound)?;
        }
        Ok(node)
    }

    /// Existence-check variant of resolve: absence is Ok(None), not an error.
    pub fn lookup(&self, path: &str) -> FsResult<Option<&Entry>> {
        match self.resolve(path) {
            Ok(entry) => Ok(Some(entry)),
            Err(FsError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Wire a new entry into the tree under its parent.
    pub fn insert(&mut self, entry: Entry) {
        if let Some(parent) = self.entries.get_mut(&entry.parent_id) {
            parent.children.insert(entry.name.clone(), entry.id);
        }
        self.entries.insert(entry.id, entry);
    }

    pub fn set_mtime(&mut self, id: EntryId, mtime: f64) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.modified_at = mtime;
        }
    }

    /// Move an entry under a new parent and name, updating both parents'
    /// children maps.
    pub fn relink(&mut self, id: EntryId, new_parent_id: EntryId, new_name: &str) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        let old_parent_id = entry.parent_id;
        let old_name = entry.name.clone();

        if let Some(old_parent) = self.entries.get_mut(&old_parent_id) {
            old_parent.children.remove(&old_name);
        }
        if let Some(new_parent) = self.entries.get_mut(&new_parent_id) {
            new_parent.children.insert(new_name.to_string(), id);
        }
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.parent_id = new_parent_id;
            entry.name = new_name.to_string();
        }
    }

    /// Remove a single entry (file or empty directory) from the tree.
    pub fn remove(&mut self, id: EntryId) {
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };
        if let Some(parent) = self.entries.get_mut(&entry.parent_id) {
            parent.children.remove(&entry.name);
        }
    }

    /// Remove an entry and all of its descendants. The store's cascading
    /// delete only touches rows; the cache holds live entries and has to
    /// walk the subtree itself.
    pub fn remove_subtree(&mut self, id: EntryId) {
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };
        if let Some(parent) = self.entries.get_mut(&entry.parent_id) {
            parent.children.remove(&entry.name);
        }
        let mut stack: Vec<EntryId> = entry.children.values().copied().collect();
        while let Some(child_id) = stack.pop() {
            if let Some(child) = self.entries.remove(&child_id) {
                stack.extend(child.children.values().copied());
            }
        }
    }

    /// Reconstruct the absolute path of an entry by walking its parent
    /// chain up to the root.
    pub fn path_of(&self, id: EntryId) -> Option<String> {
        if id == self.root_id {
            return Some("/".to_string());
        }
        let mut names = Vec::new();
        let mut cur = self.entries.get(&id)?;
        while !cur.is_root() {
            names.push(cur.name.clone());
            cur = self.entries.get(&cur.parent_id)?;
        }
        names.reverse();
        Some(format!("/{}", names.join("/")))
    }

    /// Flatten the tree into interchange records, depth-first with children
    /// in name order. Directories are included only on request.
    pub fn flatten(&self, include_dirs: bool) -> Vec<FlatRecord> {
        let mut out = Vec::new();
        self.flatten_into(self.root_id, "", include_dirs, &mut out);
        out
    }

    fn flatten_into(&self, id: EntryId, prefix: &str, include_dirs: bool, out: &mut Vec<FlatRecord>) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        for (name, child_id) in &entry.children {
            let Some(child) = self.entries.get(child_id) else {
                continue;
            };
            let path = format!("{}/{}", prefix, name);
            if child.is_dir() {
                if include_dirs {
                    out.push(FlatRecord {
                        path: path.clone(),
                        size: child.size,
                        content_ref: child.content_ref.clone(),
                        mode: child.mode,
                    });
                }
                self.flatten_into(*child_id, &path, include_dirs, out);
            } else {
                out.push(FlatRecord {
                    path,
                    size: child.size,
                    content_ref: child.content_ref.clone(),
                    mode: child.mode,
                });
            }
        }
    }
}
