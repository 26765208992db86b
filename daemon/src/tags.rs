//! The event-tag dictionary: numeric tag to `(name, format)` bindings,
//! backed by a text file with one `id name "format"` entry per line.
//! Lookups are lock-free; mutation and file rotation serialize on the
//! file mutex.

use dashmap::DashMap;
use log::warn;
use loghub_utils::log::LogTarget;
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

/// Ids below this are reserved for statically declared tags; runtime
/// allocations start here.
const DYNAMIC_TAG_BASE: u32 = 500_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagEntry {
    pub name: String,
    pub format: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TagError {
    #[error("tag {id} is already bound to {name} \"{format}\"")]
    Conflict { id: u32, name: String, format: String },

    #[error("invalid tag field: {0}")]
    Invalid(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct TagRegistry {
    by_id: DashMap<u32, TagEntry>,
    by_name: DashMap<String, u32>,
    next_dynamic: AtomicU32,
    /// Serializes appends and rotation; lookups bypass it.
    file: Mutex<PathBuf>,
}

impl TagRegistry {
    /// Loads the dictionary from `path`. A missing file yields an empty
    /// registry; unparseable lines are skipped with a warning, matching
    /// how stale dictionaries are tolerated at boot.
    pub fn open(path: &Path) -> Result<Self, TagError> {
        let registry = TagRegistry {
            by_id: DashMap::new(),
            by_name: DashMap::new(),
            next_dynamic: AtomicU32::new(DYNAMIC_TAG_BASE),
            file: Mutex::new(path.to_path_buf()),
        };
        registry.load(path)?;
        Ok(registry)
    }

    fn load(&self, path: &Path) -> Result<(), TagError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(line) {
                Some((id, entry)) => {
                    if let Err(e) = self.bind(id, entry) {
                        warn!(
                            target: LogTarget::Daemon.as_str(),
                            "tag file line {}: {}",
                            lineno + 1,
                            e
                        );
                    }
                }
                None => {
                    warn!(
                        target: LogTarget::Daemon.as_str(),
                        "tag file line {}: unparseable: {}",
                        lineno + 1,
                        line
                    );
                }
            }
        }
        Ok(())
    }

    /// Installs a binding in memory. Idempotent for identical triples;
    /// a differing rebinding of the same id is a conflict.
    fn bind(&self, id: u32, entry: TagEntry) -> Result<bool, TagError> {
        if let Some(existing) = self.by_id.get(&id) {
            if *existing == entry {
                return Ok(false);
            }
            return Err(TagError::Conflict {
                id,
                name: existing.name.clone(),
                format: existing.format.clone(),
            });
        }
        self.by_name.entry(entry.name.clone()).or_insert(id);
        self.by_id.insert(id, entry);
        if id >= self.next_dynamic.load(Ordering::Relaxed) {
            self.next_dynamic.store(id + 1, Ordering::Relaxed);
        }
        Ok(true)
    }

    pub fn lookup(&self, id: u32) -> Option<TagEntry> {
        self.by_id.get(&id).map(|e| e.clone())
    }

    pub fn id_for(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).map(|id| *id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Returns the id bound to `(name, format)`, allocating and persisting
    /// a new dynamic tag when the name is unknown. A known name with a
    /// different format is a conflict.
    pub fn get_or_create(&self, name: &str, format: &str) -> Result<u32, TagError> {
        validate_name(name)?;
        validate_format(format)?;

        let file = self.file.lock();
        if let Some(id) = self.id_for(name) {
            let existing = self.lookup(id).unwrap();
            if existing.format == format {
                return Ok(id);
            }
            return Err(TagError::Conflict {
                id,
                name: existing.name,
                format: existing.format,
            });
        }

        let id = self.next_dynamic.fetch_add(1, Ordering::Relaxed);
        let entry = TagEntry {
            name: name.to_string(),
            format: format.to_string(),
        };
        self.bind(id, entry)?;

        let mut handle = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&*file)?;
        writeln!(handle, "{id} {name} \"{format}\"")?;
        Ok(id)
    }

    /// Rotates the dictionary file aside, rewrites it from the live
    /// bindings, and reloads.
    pub fn reinit(&self) -> Result<(), TagError> {
        let file = self.file.lock();
        let path = file.clone();

        if path.exists() {
            let suffix = chrono::Utc::now().format("%Y%m%d-%H%M%S");
            let mut rotated = path.clone().into_os_string();
            rotated.push(format!(".{suffix}"));
            std::fs::rename(&path, PathBuf::from(rotated))?;
        }

        let mut entries: Vec<(u32, TagEntry)> = self
            .by_id
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);

        let mut handle = std::fs::File::create(&path)?;
        for (id, entry) in &entries {
            writeln!(handle, "{id} {} \"{}\"", entry.name, entry.format)?;
        }
        drop(handle);

        self.by_id.clear();
        self.by_name.clear();
        self.next_dynamic.store(DYNAMIC_TAG_BASE, Ordering::Relaxed);
        self.load(&path)
    }
}

fn parse_line(line: &str) -> Option<(u32, TagEntry)> {
    let (id, rest) = line.split_once(char::is_whitespace)?;
    let id: u32 = id.parse().ok()?;
    let rest = rest.trim();
    let (name, format) = match rest.split_once(char::is_whitespace) {
        Some((name, format)) => (name, format.trim().trim_matches('"')),
        None => (rest, ""),
    };
    if name.is_empty() {
        return None;
    }
    Some((
        id,
        TagEntry {
            name: name.to_string(),
            format: format.to_string(),
        },
    ))
}

fn validate_name(name: &str) -> Result<(), TagError> {
    if name.is_empty()
        || name.starts_with('#')
        || name.contains(char::is_whitespace)
        || name.contains('"')
    {
        return Err(TagError::Invalid(format!("name: {name:?}")));
    }
    Ok(())
}

fn validate_format(format: &str) -> Result<(), TagError> {
    if format.contains('"') || format.contains('\n') {
        return Err(TagError::Invalid(format!("format: {format:?}")));
    }
    Ok(())
}
