use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub type EntryId = Uuid;

/// File type mask and the two kinds we persist.
pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;

pub const DEFAULT_DIR_MODE: u32 = S_IFDIR | 0o777;
pub const DEFAULT_FILE_MODE: u32 = S_IFREG | 0o666;

/// md5 of the empty byte string; content reference of a freshly created file.
pub const EMPTY_CONTENT_REF: &str = "d41d8cd98f00b204e9800998ecf8427e";

/// Matches the varchar(128) column in the entries table.
pub const NAME_MAX: usize = 128;

/// WinFsp well-known WD principal, reported for every entry.
pub const FIXED_UID: u32 = 65792;
pub const FIXED_GID: u32 = 65792;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// One filesystem object. Durable fields mirror one row of the entries
/// table; `children` exists only in the cache and maps child name to child
/// id (ids, not references, so the tree has no ownership cycles).
#[derive(Clone, Debug)]
pub struct Entry {
    pub id: EntryId,
    pub parent_id: EntryId,
    pub name: String,
    pub mode: u32,
    pub size: u64,
    pub content_ref: Option<String>,
    pub created_at: f64,
    pub modified_at: f64,
    pub children: BTreeMap<String, EntryId>,
}

impl Entry {
    pub fn new_dir(parent_id: EntryId, name: impl Into<String>) -> Self {
        let now = unix_timestamp();
        Self {
            id: Uuid::new_v4(),
            parent_id,
            name: name.into(),
            mode: DEFAULT_DIR_MODE,
            size: 0,
            content_ref: None,
            created_at: now,
            modified_at: now,
            children: BTreeMap::new(),
        }
    }

    pub fn new_file(parent_id: EntryId, name: impl Into<String>) -> Self {
        let now = unix_timestamp();
        Self {
            id: Uuid::new_v4(),
            parent_id,
            name: name.into(),
            mode: DEFAULT_FILE_MODE,
            size: 0,
            content_ref: Some(EMPTY_CONTENT_REF.to_string()),
            created_at: now,
            modified_at: now,
            children: BTreeMap::new(),
        }
    }

    /// The root is the sole entry whose parent is itself.
    pub fn is_root(&self) -> bool {
        self.parent_id == self.id
    }

    pub fn kind(&self) -> EntryKind {
        if self.mode & S_IFMT == S_IFDIR {
            EntryKind::Dir
        } else {
            EntryKind::File
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == EntryKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind() == EntryKind::File
    }

    pub fn attr(&self) -> EntryAttr {
        EntryAttr {
            mode: self.mode,
            size: self.size,
            atime: unix_timestamp(),
            mtime: self.modified_at,
            ctime: self.modified_at,
            nlink: 1,
            uid: FIXED_UID,
            gid: FIXED_GID,
        }
    }
}

/// Attribute view returned by getattr.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntryAttr {
    pub mode: u32,
    pub size: u64,
    pub atime: f64,
    pub mtime: f64,
    pub ctime: f64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Capacity figures returned by statfs. Everything but `files` is fixed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FsStat {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub fsid: u64,
    pub flag: u64,
    pub namemax: u32,
}

/// One record of the bulk interchange format produced by serialize() and
/// consumed by load(). Independent of the relational schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlatRecord {
    pub path: String,
    pub size: u64,
    pub content_ref: Option<String>,
    pub mode: u32,
}

/// Seconds since epoch, fractional.
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
