//! Hierarchical on-disk experiment store.
//!
//! A [`Store`] presents a filesystem subtree as a tree of [`Handle`]s. Directories carry a
//! metadata sidecar (`.info`, see [`info`]) and an append-only log (`.log`, see [`log`]);
//! files are written and read through a registry of typed codecs (see [`codec`]).
//!
//! ## Handle identity
//! Handles are interned: every lookup of the same node returns the same underlying object,
//! so listeners attached to a handle keep working after the node, or any of its ancestors,
//! is renamed or moved. Renames rewrite the path of every live handle in the affected
//! subtree.
//!
//! ## Atomicity
//! - Directory creation writes the new directory's info into a hidden temporary directory
//!   that is renamed into place, so a directory never appears without its info.
//! - Sidecars and files are written to a hidden temporary sibling and renamed into place.
//! - Appends (`append_axis`) read, concatenate and rewrite the whole file the same way;
//!   a schema mismatch leaves the existing file untouched.
//!
//! ## Locking
//! Each directory handle owns a lock guarding its sidecar and its log. Change
//! notifications are emitted after all locks are released.

pub mod codec;
pub mod info;
pub mod log;
pub mod metaarray;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use crate::clock;
use crate::error::{Error, Result};
use crate::events::Emitter;
use crate::utils::{increment_name, is_hidden, sequence_child_name};

pub use codec::{Codec, CodecRegistry, FileData};
pub use info::{DirType, Info};
pub use log::LogEntry;
pub use metaarray::{AxisInfo, ColumnInfo, MetaArray};

/// Change notification delivered to handle listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum HandleChange {
    /// This node was renamed in place.
    Renamed { old: String, new: String },
    /// This node was moved to another directory.
    Moved { old: String, new: String },
    /// An ancestor was renamed or moved; this node's path changed.
    Parent { old: String, new: String },
    /// A log entry was appended to this directory or one of its descendants.
    Log,
    /// Info of this node changed.
    Meta,
    /// A child was created in this directory.
    Children,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMode {
    /// By creation timestamp from the info sidecar, then name.
    Chrono,
    Name,
    /// Filesystem order.
    None,
}

/// Options for [`Handle::write_file`].
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Registry name of the codec; bypasses the vote.
    pub filetype: Option<String>,
    pub auto_increment: bool,
    /// Append along this axis when the file already exists.
    pub append_axis: Option<String>,
    pub info: Option<Info>,
}

pub(crate) struct StoreInner {
    root: PathBuf,
    handles: Mutex<HashMap<PathBuf, Weak<HandleInner>>>,
    codecs: RwLock<CodecRegistry>,
}

/// Root of an experiment data tree. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct HandleInner {
    store: Arc<StoreInner>,
    rel: RwLock<PathBuf>,
    is_dir: bool,
    lock: Mutex<()>,
    changes: Emitter<HandleChange>,
}

/// Reference to one node (file or directory) of a [`Store`].
///
/// Two handles compare equal iff they refer to the same interned node.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Handle {}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("path", &self.rel_path())
            .field("is_dir", &self.inner.is_dir)
            .finish()
    }
}

/// Writes `bytes` to a hidden temporary sibling of `path` and renames it into place.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("file");
    let tmp = dir.join(format!(".{}.tmp", name));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn rel_string(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn already_exists(path: &Path) -> Error {
    Error::Io(std::io::Error::new(
        ErrorKind::AlreadyExists,
        format!("{:?} already exists", path),
    ))
}

impl Store {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(root.as_ref())?;
        let root = fs::canonicalize(root.as_ref())?;
        tracing::debug!(root = ?root, "opened store");
        Ok(Self {
            inner: Arc::new(StoreInner {
                root,
                handles: Mutex::new(HashMap::new()),
                codecs: RwLock::new(CodecRegistry::with_defaults()),
            }),
        })
    }

    pub fn root_path(&self) -> &Path {
        &self.inner.root
    }

    pub fn root(&self) -> Handle {
        self.inner.intern(PathBuf::new(), true)
    }

    /// Handle for `path` (relative to the root, `/`-separated). Fails
    /// [`Error::NotFound`] when no such node exists.
    pub fn get_handle(&self, path: impl AsRef<Path>) -> Result<Handle> {
        let rel = normalize(path.as_ref());
        let abs = self.inner.root.join(&rel);
        let meta = fs::metadata(&abs).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::NotFound(rel.clone()),
            _ => Error::Io(e),
        })?;
        Ok(self.inner.intern(rel, meta.is_dir()))
    }

    pub fn register_codec(&self, codec: Arc<dyn Codec>) {
        self.inner.codecs.write().register(codec);
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter_map(|c| match c {
            std::path::Component::Normal(s) => Some(s),
            _ => None,
        })
        .collect()
}

impl StoreInner {
    fn intern(self: &Arc<Self>, rel: PathBuf, is_dir: bool) -> Handle {
        let mut table = self.handles.lock();
        if let Some(inner) = table.get(&rel).and_then(Weak::upgrade) {
            return Handle { inner };
        }
        table.retain(|_, w| w.strong_count() > 0);
        let inner = Arc::new(HandleInner {
            store: self.clone(),
            rel: RwLock::new(rel.clone()),
            is_dir,
            lock: Mutex::new(()),
            changes: Emitter::new(),
        });
        table.insert(rel, Arc::downgrade(&inner));
        Handle { inner }
    }

    fn live(&self, rel: &Path) -> Option<Handle> {
        self.handles
            .lock()
            .get(rel)
            .and_then(Weak::upgrade)
            .map(|inner| Handle { inner })
    }

    /// Re-keys every live handle under `old` to `new`. Returns the handles of the subtree
    /// (excluding the node itself) with their old and new paths.
    fn rekey(&self, old: &Path, new: &Path) -> Vec<(Handle, String, String)> {
        let mut table = self.handles.lock();
        let keys: Vec<PathBuf> = table.keys().filter(|k| k.starts_with(old)).cloned().collect();
        let mut moved = Vec::new();
        for key in keys {
            let Some(weak) = table.remove(&key) else { continue };
            let Some(inner) = weak.upgrade() else { continue };
            let suffix = key.strip_prefix(old).unwrap_or(Path::new(""));
            let new_key = new.join(suffix);
            *inner.rel.write() = new_key.clone();
            table.insert(new_key.clone(), weak);
            if key != old {
                moved.push((Handle { inner }, rel_string(&key), rel_string(&new_key)));
            }
        }
        moved
    }
}

impl Handle {
    fn store(&self) -> &Arc<StoreInner> {
        &self.inner.store
    }

    /// Path relative to the store root.
    pub fn rel(&self) -> PathBuf {
        self.inner.rel.read().clone()
    }

    /// Platform-neutral `/`-separated path relative to the store root.
    pub fn rel_path(&self) -> String {
        rel_string(&self.rel())
    }

    /// Absolute filesystem path.
    pub fn path(&self) -> PathBuf {
        self.store().root.join(self.rel())
    }

    pub fn name(&self) -> String {
        self.rel()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn is_dir(&self) -> bool {
        self.inner.is_dir
    }

    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    pub fn store_handle(&self) -> Store {
        Store {
            inner: self.store().clone(),
        }
    }

    /// Parent directory; `None` for the store root.
    pub fn parent(&self) -> Option<Handle> {
        let rel = self.rel();
        let parent = rel.parent()?.to_path_buf();
        Some(self.store().intern(parent, true))
    }

    pub fn child(&self, name: &str) -> Result<Handle> {
        self.store_handle().get_handle(self.rel().join(name))
    }

    /// `self`'s path relative to `ancestor`, if it is one.
    pub fn relative_to(&self, ancestor: &Handle) -> Option<String> {
        self.rel().strip_prefix(ancestor.rel()).ok().map(rel_string)
    }

    pub fn changes(&self) -> &Emitter<HandleChange> {
        &self.inner.changes
    }

    fn require_dir(&self) -> Result<()> {
        if self.is_dir() {
            Ok(())
        } else {
            Err(Error::Io(std::io::Error::new(
                ErrorKind::Other,
                format!("{} is not a directory", self.rel_path()),
            )))
        }
    }

    /// Directory handle holding this node's info / log.
    fn owning_dir(&self) -> Result<Handle> {
        if self.is_dir() {
            Ok(self.clone())
        } else {
            self.parent().ok_or_else(|| Error::NotFound(self.rel()))
        }
    }

    // Info ---------------------------------------------------------------

    /// Deep copy of this node's info. Missing sidecar reads as empty info.
    pub fn info(&self) -> Result<Info> {
        let dir = self.owning_dir()?;
        let _guard = dir.inner.lock.lock();
        let sidecar = info::read_sidecar(&dir.path())?;
        Ok(info::entry(&sidecar, &self.info_key()))
    }

    fn info_key(&self) -> String {
        if self.is_dir() {
            info::SELF_KEY.to_string()
        } else {
            self.name()
        }
    }

    /// Merges `update` into this node's info (top-level keys replace).
    ///
    /// `sequenceParams` of a directory cannot change once it has children.
    pub fn set_info(&self, update: Info) -> Result<()> {
        let dir = self.owning_dir()?;
        {
            let _guard = dir.inner.lock.lock();
            let mut sidecar = info::read_sidecar(&dir.path())?;
            let key = self.info_key();
            if self.is_dir() {
                if let Some(new_params) = update.get(info::SEQUENCE_PARAMS_KEY) {
                    let current = info::entry(&sidecar, &key);
                    if current.get(info::SEQUENCE_PARAMS_KEY) != Some(new_params) && !self.subdir_names()?.is_empty() {
                        return Err(Error::SequenceLocked(self.rel()));
                    }
                }
            }
            info::merge_entry(&mut sidecar, &key, update);
            info::write_sidecar(&dir.path(), &sidecar)?;
        }
        self.inner.changes.emit(&HandleChange::Meta);
        Ok(())
    }

    /// Shortcut for setting one key.
    pub fn set_info_value(&self, key: &str, value: Value) -> Result<()> {
        let mut update = Info::new();
        update.insert(key.to_string(), value);
        self.set_info(update)
    }

    pub fn dir_type(&self) -> Result<Option<DirType>> {
        Ok(info::dir_type(&self.info()?))
    }

    // Listing ------------------------------------------------------------

    fn subdir_names(&self) -> Result<Vec<String>> {
        Ok(self
            .raw_entries()?
            .into_iter()
            .filter(|(_, is_dir)| *is_dir)
            .map(|(name, _)| name)
            .collect())
    }

    fn raw_entries(&self) -> Result<Vec<(String, bool)>> {
        self.require_dir()?;
        let mut out = Vec::new();
        for entry in fs::read_dir(self.path())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_hidden(&name) {
                continue;
            }
            out.push((name, entry.file_type()?.is_dir()));
        }
        Ok(out)
    }

    /// Names of all visible children, sorted by name.
    pub fn ls(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.raw_entries()?.into_iter().map(|(n, _)| n).collect();
        names.sort();
        Ok(names)
    }

    pub fn subdirs(&self, sort: SortMode) -> Result<Vec<Handle>> {
        let mut names = self.subdir_names()?;
        match sort {
            SortMode::None => {}
            SortMode::Name => names.sort(),
            SortMode::Chrono => {
                let mut keyed = Vec::with_capacity(names.len());
                for name in names {
                    let sidecar = info::read_sidecar(&self.path().join(&name))?;
                    let ts = info::timestamp(&info::entry(&sidecar, info::SELF_KEY)).unwrap_or(f64::INFINITY);
                    keyed.push((ts, name));
                }
                keyed.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
                names = keyed.into_iter().map(|(_, n)| n).collect();
            }
        }
        let base = self.rel();
        Ok(names
            .into_iter()
            .map(|n| self.store().intern(base.join(n), true))
            .collect())
    }

    // Creation -----------------------------------------------------------

    fn free_name(&self, name: &str, auto_increment: bool) -> Result<String> {
        let dir = self.path();
        if !auto_increment {
            if dir.join(name).exists() {
                return Err(already_exists(&dir.join(name)));
            }
            return Ok(name.to_string());
        }
        let mut n = 0;
        loop {
            let candidate = increment_name(name, n);
            if !dir.join(&candidate).exists() {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    /// Creates a subdirectory with `info` as its DirectoryInfo. With `auto_increment` the
    /// name is a stem and the first free `_NNN` suffix is appended.
    pub fn mkdir(&self, name: &str, auto_increment: bool, info: Option<Info>) -> Result<Handle> {
        self.require_dir()?;
        let handle = {
            let _guard = self.inner.lock.lock();
            let name = self.free_name(name, auto_increment)?;
            let mut dir_info = Info::new();
            dir_info.insert(info::TIMESTAMP_KEY.to_string(), json!(clock::now()));
            if let Some(extra) = info {
                dir_info.extend(extra);
            }
            let mut sidecar = Info::new();
            sidecar.insert(info::SELF_KEY.to_string(), Value::Object(dir_info));

            let staging = self.path().join(format!(".{}.mkdir", name));
            if staging.exists() {
                fs::remove_dir_all(&staging)?;
            }
            fs::create_dir(&staging)?;
            let created = info::write_sidecar(&staging, &sidecar)
                .and_then(|_| fs::rename(&staging, self.path().join(&name)).map_err(Error::from));
            if let Err(e) = created {
                let _ = fs::remove_dir_all(&staging);
                return Err(e);
            }
            tracing::debug!(parent = %self.rel_path(), name = %name, "mkdir");
            self.store().intern(self.rel().join(&name), true)
        };
        self.inner.changes.emit(&HandleChange::Children);
        Ok(handle)
    }

    /// Creates the child of a sequence directory for the point `indices` (one index per
    /// sequence parameter, in declaration order). The point's parameter values are
    /// recorded in the child's info.
    pub fn mkdir_sequence_point(&self, indices: &[usize]) -> Result<Handle> {
        let params = self.list_sequence_params()?;
        if indices.is_empty() || indices.len() > params.len() {
            return Err(Error::invalid(
                &self.rel_path(),
                format!("{} indices for {} sequence parameters", indices.len(), params.len()),
            ));
        }
        let mut point = Info::new();
        for ((key, values), idx) in params.iter().zip(indices) {
            let value = values.get(*idx).ok_or_else(|| {
                Error::invalid(
                    &self.rel_path(),
                    format!("index {} out of range for '{}' ({} values)", idx, key, values.len()),
                )
            })?;
            point.insert(key.clone(), value.clone());
        }
        self.mkdir(&sequence_child_name(indices), false, Some(point))
    }

    /// Ordered sequence parameters; empty when this is not a sequence directory.
    pub fn list_sequence_params(&self) -> Result<IndexMap<String, Vec<Value>>> {
        if !self.is_dir() {
            return Ok(IndexMap::new());
        }
        Ok(info::sequence_params(&self.info()?))
    }

    // Files --------------------------------------------------------------

    /// Writes `data` into this directory and returns the file's handle.
    ///
    /// The codec is chosen by `options.filetype` or by vote; it may rewrite the
    /// extension. With `append_axis` and an existing file, data is concatenated along
    /// that axis or the write fails [`Error::SchemaMismatch`] leaving the file untouched.
    pub fn write_file(&self, data: &FileData, filename: &str, options: WriteOptions) -> Result<Handle> {
        self.require_dir()?;
        let codec = {
            let codecs = self.store().codecs.read();
            match &options.filetype {
                Some(ft) => codecs.by_name(ft),
                None => codecs.select(data, filename),
            }
        }
        .ok_or_else(|| Error::invalid(filename, "no codec accepts this data"))?;

        let handle = {
            let _guard = self.inner.lock.lock();
            let target = codec.filename(filename);
            let existing = self.path().join(&target);
            let (name, payload) = match &options.append_axis {
                Some(axis) if existing.exists() => {
                    let current = codec.decode(&fs::read(&existing)?)?;
                    let merged = codec.append(current, data, axis, &existing)?;
                    (target, codec.encode(&merged)?)
                }
                _ => {
                    let name = self.free_name(&target, options.auto_increment)?;
                    (name, codec.encode(data)?)
                }
            };
            write_atomic(&self.path().join(&name), &payload)?;

            let mut sidecar = info::read_sidecar(&self.path())?;
            let mut file_info = Info::new();
            if !sidecar.contains_key(&name) {
                file_info.insert(info::TIMESTAMP_KEY.to_string(), json!(clock::now()));
                file_info.insert("filetype".to_string(), json!(codec.name()));
            }
            if let Some(extra) = options.info {
                file_info.extend(extra);
            }
            if !file_info.is_empty() {
                info::merge_entry(&mut sidecar, &name, file_info);
                info::write_sidecar(&self.path(), &sidecar)?;
            }
            tracing::debug!(dir = %self.rel_path(), file = %name, codec = codec.name(), "wrote file");
            self.store().intern(self.rel().join(&name), false)
        };
        self.inner.changes.emit(&HandleChange::Children);
        Ok(handle)
    }

    /// Decodes this file with the codec owning its extension.
    pub fn read_file(&self) -> Result<FileData> {
        if self.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::Other,
                format!("{} is a directory", self.rel_path()),
            )));
        }
        let codec = self
            .store()
            .codecs
            .read()
            .for_file(&self.name())
            .ok_or_else(|| Error::invalid(&self.name(), "no codec for this file"))?;
        codec.decode(&fs::read(self.path())?)
    }

    // Logs ---------------------------------------------------------------

    /// Appends an entry to this directory's log (a file handle logs into its parent) and
    /// notifies this handle and every live ancestor.
    /// Fails [`Error::InvalidParams`] when an extra field reuses one of the entry's own
    /// keys (see [`log::RESERVED_KEYS`]); nothing is written then.
    pub fn log(&self, entry: LogEntry) -> Result<()> {
        if let Some(key) = log::reserved_extra(&entry) {
            return Err(Error::invalid("log", format!("extra field '{}' is reserved", key)));
        }
        let dir = self.owning_dir()?;
        {
            let _guard = dir.inner.lock.lock();
            log::append(&dir.path(), &entry)?;
        }
        let mut rel = Some(dir.rel());
        while let Some(r) = rel {
            if let Some(h) = self.store().live(&r) {
                h.inner.changes.emit(&HandleChange::Log);
            }
            rel = r.parent().map(Path::to_path_buf);
        }
        Ok(())
    }

    /// Shortcut for logging a message with a source tag and extra fields.
    pub fn log_message(&self, message: &str, source: Option<&str>, extra: Info) -> Result<()> {
        let mut entry = LogEntry::new(message).with_extra(extra);
        entry.source = source.map(str::to_string);
        self.log(entry)
    }

    /// Entries of this directory's log in time order. With `recursive`, entries of every
    /// descendant are merged in, each tagged with its `subdir` relative to this directory.
    pub fn read_log(&self, recursive: bool) -> Result<Vec<LogEntry>> {
        let dir = self.owning_dir()?;
        let mut entries = dir.read_own_log()?;
        if recursive {
            dir.collect_descendant_logs(&dir, &mut entries)?;
        }
        log::sort_entries(&mut entries);
        Ok(entries)
    }

    fn read_own_log(&self) -> Result<Vec<LogEntry>> {
        let raw = {
            let _guard = self.inner.lock.lock();
            log::read_raw(&self.path())?
        };
        Ok(log::parse(&raw))
    }

    fn collect_descendant_logs(&self, top: &Handle, out: &mut Vec<LogEntry>) -> Result<()> {
        for sub in self.subdirs(SortMode::Name)? {
            let prefix = sub.relative_to(top).unwrap_or_default();
            for mut entry in sub.read_own_log()? {
                entry.subdir = Some(match entry.subdir.take() {
                    Some(inner) => format!("{}/{}", prefix, inner),
                    None => prefix.clone(),
                });
                out.push(entry);
            }
            sub.collect_descendant_logs(top, out)?;
        }
        Ok(())
    }

    // Rename / move ------------------------------------------------------

    /// Renames this node in place. Outstanding handles of the subtree follow the rename.
    pub fn rename(&self, new_name: &str) -> Result<()> {
        if new_name.is_empty() || new_name.contains('/') || is_hidden(new_name) {
            return Err(Error::invalid(&self.rel_path(), format!("invalid name '{}'", new_name)));
        }
        let parent = self.parent().ok_or_else(|| Error::invalid("", "cannot rename the store root"))?;
        let (old, new, moved) = parent.relocate_child(self, &parent, new_name)?;
        self.inner.changes.emit(&HandleChange::Renamed { old, new });
        for (h, old, new) in moved {
            h.inner.changes.emit(&HandleChange::Parent { old, new });
        }
        Ok(())
    }

    /// Moves this node into `new_parent`, keeping its name.
    pub fn move_to(&self, new_parent: &Handle) -> Result<()> {
        new_parent.require_dir()?;
        if new_parent.rel().starts_with(self.rel()) {
            return Err(Error::invalid(&self.rel_path(), "cannot move a directory into itself"));
        }
        let parent = self.parent().ok_or_else(|| Error::invalid("", "cannot move the store root"))?;
        let name = self.name();
        let (old, new, moved) = parent.relocate_child(self, new_parent, &name)?;
        self.inner.changes.emit(&HandleChange::Moved { old, new });
        for (h, old, new) in moved {
            h.inner.changes.emit(&HandleChange::Parent { old, new });
        }
        Ok(())
    }

    /// Moves `child` (a child of `self`) to `dest/new_name`, carrying file info along.
    fn relocate_child(
        &self,
        child: &Handle,
        dest: &Handle,
        new_name: &str,
    ) -> Result<(String, String, Vec<(Handle, String, String)>)> {
        let old_rel = child.rel();
        let new_rel = dest.rel().join(new_name);
        let old_name = child.name();
        {
            // Directory locks are always taken in path order.
            let (first, second) = if dest.rel() < self.rel() { (dest, self) } else { (self, dest) };
            let _first = first.inner.lock.lock();
            let _second = if dest != self { Some(second.inner.lock.lock()) } else { None };
            let new_abs = dest.path().join(new_name);
            if new_abs.exists() {
                return Err(already_exists(&new_abs));
            }
            fs::rename(child.path(), &new_abs)?;
            if !child.is_dir() {
                let mut src_sidecar = info::read_sidecar(&self.path())?;
                if let Some(file_info) = src_sidecar.shift_remove(&old_name) {
                    if dest == self {
                        src_sidecar.insert(new_name.to_string(), file_info);
                    } else {
                        let mut dst_sidecar = info::read_sidecar(&dest.path())?;
                        dst_sidecar.insert(new_name.to_string(), file_info);
                        info::write_sidecar(&dest.path(), &dst_sidecar)?;
                    }
                    info::write_sidecar(&self.path(), &src_sidecar)?;
                }
            }
        }
        let moved = self.store().rekey(&old_rel, &new_rel);
        tracing::debug!(from = %rel_string(&old_rel), to = %rel_string(&new_rel), "relocated");
        self.inner.changes.emit(&HandleChange::Children);
        if dest != self {
            dest.inner.changes.emit(&HandleChange::Children);
        }
        Ok((rel_string(&old_rel), rel_string(&new_rel), moved))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn info_of(v: Value) -> Info {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn handles_are_interned() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let a = store.root().mkdir("a", false, None).unwrap();
        let again = store.get_handle("a").unwrap();
        assert_eq!(a, again);
        assert_eq!(a.parent().unwrap(), store.root());
        assert!(matches!(store.get_handle("missing"), Err(Error::NotFound(_))));
    }

    #[test]
    fn mkdir_auto_increment() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let root = store.root();
        let c0 = root.mkdir("cell", true, None).unwrap();
        let c1 = root.mkdir("cell", true, None).unwrap();
        assert_eq!(c0.name(), "cell_000");
        assert_eq!(c1.name(), "cell_001");
        assert!(root.mkdir("cell_000", false, None).is_err());
        // No staging leftovers are visible
        assert_eq!(root.ls().unwrap(), vec!["cell_000", "cell_001"]);
        assert!(info::timestamp(&c0.info().unwrap()).is_some());
    }

    #[test]
    fn info_merge_and_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let day = store
            .root()
            .mkdir("day", false, Some(info_of(json!({"dirType": "Day", "rig": {"name": "A"}}))))
            .unwrap();
        assert_eq!(day.dir_type().unwrap(), Some(DirType::Day));
        day.set_info(info_of(json!({"temp": 32.5}))).unwrap();
        let mut copy = day.info().unwrap();
        assert_eq!(copy["temp"], json!(32.5));
        assert_eq!(copy["rig"], json!({"name": "A"}));
        copy.insert("temp".into(), json!(0));
        assert_eq!(day.info().unwrap()["temp"], json!(32.5));
    }

    #[test]
    fn sequence_params_locked_after_children() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let seq = store
            .root()
            .mkdir(
                "seq",
                false,
                Some(info_of(json!({"dirType": "ProtocolSequence", "sequenceParams": {"amp": [1, 2]}}))),
            )
            .unwrap();
        seq.set_info(info_of(json!({"sequenceParams": {"amp": [1, 2, 3]}}))).unwrap();
        let child = seq.mkdir_sequence_point(&[2]).unwrap();
        assert_eq!(child.name(), "002");
        assert_eq!(child.info().unwrap()["amp"], json!(3));
        assert!(seq.mkdir_sequence_point(&[3]).is_err());
        let err = seq.set_info(info_of(json!({"sequenceParams": {"amp": [9]}}))).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SequenceLocked);
        // Unchanged value and other keys are still writable
        seq.set_info(info_of(json!({"sequenceParams": {"amp": [1, 2, 3]}, "note": "x"}))).unwrap();
    }

    #[test]
    fn rename_updates_subtree_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let a = store.root().mkdir("a", false, None).unwrap();
        let b = a.mkdir("b", false, None).unwrap();
        let c = b.mkdir("c", false, None).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        c.changes().on(move |ev| s.lock().push(ev.clone()));
        b.rename("b2").unwrap();
        assert_eq!(c.rel_path(), "a/b2/c");
        assert_eq!(b.rel_path(), "a/b2");
        assert_eq!(store.get_handle("a/b2/c").unwrap(), c);
        assert_eq!(
            *seen.lock(),
            vec![HandleChange::Parent {
                old: "a/b/c".into(),
                new: "a/b2/c".into()
            }]
        );
        assert!(b.rename("../x").is_err());
    }

    #[test]
    fn file_info_follows_rename_and_move() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let root = store.root();
        let sub = root.mkdir("sub", false, None).unwrap();
        let f = root
            .write_file(
                &FileData::Text("hello".into()),
                "notes",
                WriteOptions {
                    info: Some(info_of(json!({"author": "x"}))),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(f.name(), "notes.txt");
        assert_eq!(f.info().unwrap()["author"], json!("x"));
        f.rename("renamed.txt").unwrap();
        assert_eq!(f.info().unwrap()["author"], json!("x"));
        f.move_to(&sub).unwrap();
        assert_eq!(f.rel_path(), "sub/renamed.txt");
        assert_eq!(f.info().unwrap()["author"], json!("x"));
        assert_eq!(f.read_file().unwrap(), FileData::Text("hello".into()));
        assert!(sub.move_to(&sub).is_err());
    }

    #[test]
    fn log_propagates_to_ancestors() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let root = store.root();
        let a = root.mkdir("a", false, None).unwrap();
        let b = a.mkdir("b", false, None).unwrap();
        let count = Arc::new(Mutex::new(0));
        let c2 = count.clone();
        root.changes().on(move |ev| {
            if *ev == HandleChange::Log {
                *c2.lock() += 1;
            }
        });
        b.log_message("deep", Some("test"), Info::new()).unwrap();
        assert_eq!(*count.lock(), 1);
        let entries = b.read_log(false).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].source.as_deref(), Some("test"));
    }
}
