use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::hash::Hash;

use super::entry::{CacheHooks, Entry, EntryRef};
use super::file::File;

struct RootInfo {
    id: RwLock<Hash>,
    path: PathBuf,
}

struct DirInner {
    name: String,
    size: u64,
    dirs: Vec<Arc<Directory>>,
    files: Vec<Arc<File>>,
}

/// A directory in the shared tree.
///
/// Owns its subdirectories and files; its size is the sum of all children,
/// maintained incrementally on every add, remove and resize. A directory
/// created through [`Directory::new_root`] is the root of a shared tree and
/// additionally carries a stable id and an absolute mount path.
pub struct Directory {
    this: Weak<Directory>,
    hooks: Weak<dyn CacheHooks>,
    parent: RwLock<Weak<Directory>>,
    root: Option<RootInfo>,
    inner: Mutex<DirInner>,
}

impl Directory {
    /// Creates the root of a shared tree mounted at `path`.
    pub(crate) fn new_root(hooks: Weak<dyn CacheHooks>, path: &Path, id: Hash) -> Arc<Directory> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        debug!(path = %path.display(), %id, "new shared directory");
        Arc::new_cyclic(|this| Directory {
            this: this.clone(),
            hooks,
            parent: RwLock::new(Weak::new()),
            root: Some(RootInfo {
                id: RwLock::new(id),
                path: path.to_path_buf(),
            }),
            inner: Mutex::new(DirInner {
                name,
                size: 0,
                dirs: Vec::new(),
                files: Vec::new(),
            }),
        })
    }

    /// Creates a subdirectory of `parent` and links it into the tree.
    pub fn new(parent: &Arc<Directory>, name: &str) -> Arc<Directory> {
        let dir = Arc::new_cyclic(|this| Directory {
            this: this.clone(),
            hooks: parent.hooks.clone(),
            parent: RwLock::new(Arc::downgrade(parent)),
            root: None,
            inner: Mutex::new(DirInner {
                name: name.to_string(),
                size: 0,
                dirs: Vec::new(),
                files: Vec::new(),
            }),
        });
        parent.add_subdir(&dir);
        dir
    }

    pub(crate) fn hooks(&self) -> Weak<dyn CacheHooks> {
        self.hooks.clone()
    }

    fn hooks_arc(&self) -> Option<Arc<dyn CacheHooks>> {
        self.hooks.upgrade()
    }

    /// `true` for the root of a shared tree.
    pub fn is_root(&self) -> bool {
        self.root.is_some()
    }

    /// Stable id, present on shared roots only.
    pub fn id(&self) -> Option<Hash> {
        self.root.as_ref().map(|r| *r.id.read())
    }

    /// Re-adopts a persisted id on a shared root.
    pub(crate) fn set_id(&self, id: Hash) {
        if let Some(root) = &self.root {
            *root.id.write() = id;
        }
    }

    /// Absolute mount path, present on shared roots only.
    pub fn share_path(&self) -> Option<&Path> {
        self.root.as_ref().map(|r| r.path.as_path())
    }

    pub fn parent(&self) -> Option<Arc<Directory>> {
        self.parent.read().upgrade()
    }

    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    /// Cumulative size of every file below this directory.
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn full_path(&self) -> PathBuf {
        if let Some(root) = &self.root {
            return root.path.clone();
        }
        let name = self.name();
        match self.parent() {
            Some(parent) => parent.full_path().join(name),
            None => PathBuf::from(name),
        }
    }

    /// Path relative to the shared root. The root itself reports `"/"` and
    /// its name never appears in the assembled string.
    pub fn relative_path(&self) -> String {
        if self.is_root() {
            return "/".to_string();
        }
        let name = self.name();
        match self.parent() {
            Some(parent) => format!("{}{}/", parent.relative_path(), name),
            None => format!("/{name}/"),
        }
    }

    /// Walks parent links up to the enclosing shared root.
    pub fn root_dir(&self) -> Option<Arc<Directory>> {
        if self.is_root() {
            return self.this.upgrade();
        }
        self.parent()?.root_dir()
    }

    /// Snapshot of the files directly in this directory.
    pub fn files(&self) -> Vec<Arc<File>> {
        self.inner.lock().files.clone()
    }

    /// Snapshot of the direct subdirectories.
    pub fn subdirs(&self) -> Vec<Arc<Directory>> {
        self.inner.lock().dirs.clone()
    }

    /// Finds a direct child file by exact name.
    pub fn find_file(&self, name: &str) -> Option<Arc<File>> {
        self.files().into_iter().find(|f| f.name() == name)
    }

    /// Finds a direct subdirectory by exact name.
    pub fn find_subdir(&self, name: &str) -> Option<Arc<Directory>> {
        self.subdirs().into_iter().find(|d| d.name() == name)
    }

    fn add_subdir(self: &Arc<Self>, child: &Arc<Directory>) {
        let child_size = child.size();
        {
            let mut inner = self.inner.lock();
            inner.dirs.push(child.clone());
            inner.size += child_size;
        }
        if child_size > 0 {
            self.propagate_size_delta(child_size as i64);
        }
        if let Some(hooks) = self.hooks_arc() {
            hooks.entry_added(&EntryRef::Directory(child.clone()));
        }
    }

    /// Links `file` into this directory, updating cumulative sizes and the
    /// entry index.
    pub(crate) fn add_file(self: &Arc<Self>, file: Arc<File>) {
        let file_size = file.size();
        {
            let mut inner = self.inner.lock();
            inner.files.push(file.clone());
            inner.size += file_size;
        }
        if file_size > 0 {
            self.propagate_size_delta(file_size as i64);
        }
        if let Some(hooks) = self.hooks_arc() {
            hooks.entry_added(&EntryRef::File(file));
        }
    }

    /// Unlinks `file` from this directory.
    pub(crate) fn file_deleted(self: &Arc<Self>, file: &Arc<File>) {
        let removed_size = {
            let mut inner = self.inner.lock();
            let before = inner.files.len();
            inner.files.retain(|f| !Arc::ptr_eq(f, file));
            if inner.files.len() == before {
                return;
            }
            let size = file.size();
            inner.size = inner.size.saturating_sub(size);
            size
        };
        if removed_size > 0 {
            self.propagate_size_delta(-(removed_size as i64));
        }
        if let Some(hooks) = self.hooks_arc() {
            hooks.entry_removed(&EntryRef::File(file.clone()));
        }
    }

    /// A child file was renamed; re-registers it in the entry index.
    pub(crate) fn file_name_changed(&self, file: &Arc<File>) {
        if let Some(hooks) = self.hooks_arc() {
            hooks.entry_added(&EntryRef::File(file.clone()));
        }
    }

    /// A child file was resized; adjusts cumulative sizes up to the root.
    pub(crate) fn file_size_changed(self: &Arc<Self>, old_size: u64, new_size: u64) {
        if old_size == new_size {
            return;
        }
        let delta = new_size as i64 - old_size as i64;
        {
            let mut inner = self.inner.lock();
            inner.size = apply_delta(inner.size, delta);
        }
        self.propagate_size_delta(delta);
    }

    fn propagate_size_delta(self: &Arc<Self>, delta: i64) {
        let mut current = self.parent();
        while let Some(dir) = current {
            {
                let mut inner = dir.inner.lock();
                inner.size = apply_delta(inner.size, delta);
            }
            current = dir.parent();
        }
    }

    /// Renames this directory, re-registering it in the entry index.
    pub fn rename(self: &Arc<Self>, new_name: &str) {
        let hooks = self.hooks_arc();
        if let Some(hooks) = &hooks {
            hooks.entry_removed(&EntryRef::Directory(self.clone()));
        }
        self.inner.lock().name = new_name.to_string();
        if let Some(hooks) = &hooks {
            hooks.entry_added(&EntryRef::Directory(self.clone()));
        }
    }

    /// `true` if `other` is an ancestor of this directory.
    pub fn is_child_of(&self, other: &Arc<Directory>) -> bool {
        let mut current = self.parent();
        while let Some(dir) = current {
            if Arc::ptr_eq(&dir, other) {
                return true;
            }
            current = dir.parent();
        }
        false
    }

    /// Tears the whole subtree down: unfinished physical files are removed,
    /// chunks unregistered, handles force-released.
    pub(crate) fn delete_recursive(self: &Arc<Self>) {
        for file in self.files() {
            file.remove_unfinished_files();
            file.delete();
        }
        for dir in self.subdirs() {
            dir.delete_recursive();
        }
        self.inner.lock().dirs.clear();
        if !self.is_root() {
            if let Some(hooks) = self.hooks_arc() {
                hooks.entry_removed(&EntryRef::Directory(self.clone()));
            }
        }
    }
}

impl Entry for Directory {
    fn name(&self) -> String {
        Directory::name(self)
    }

    fn size(&self) -> u64 {
        Directory::size(self)
    }

    fn full_path(&self) -> PathBuf {
        Directory::full_path(self)
    }

    fn relative_path(&self) -> String {
        Directory::relative_path(self)
    }

    fn root_dir(&self) -> Option<Arc<Directory>> {
        Directory::root_dir(self)
    }
}

fn apply_delta(size: u64, delta: i64) -> u64 {
    if delta >= 0 {
        size + delta as u64
    } else {
        size.saturating_sub(delta.unsigned_abs())
    }
}

/// Handle over the root of a shared tree.
///
/// A shared directory has a stable id that survives restarts (re-adopted
/// from the hash cache) and an absolute filesystem mount path.
#[derive(Clone)]
pub struct SharedDirectory {
    root: Arc<Directory>,
}

impl SharedDirectory {
    pub(crate) fn new(root: Arc<Directory>) -> Self {
        Self { root }
    }

    pub fn id(&self) -> Hash {
        self.root.id().unwrap_or(Hash::NULL)
    }

    pub fn share_path(&self) -> PathBuf {
        self.root
            .share_path()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.root
    }
}
