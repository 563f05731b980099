//! Named output sinks for trace and statistics rows.
//!
//! A sink is opened by name; opening the same name twice returns the same
//! sink, so deterministic names are enough to keep repeated activations from
//! creating duplicate files. File sinks are line-buffered: each row is on disk
//! before the writing callback returns.

use crate::error::SinkError;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SinkId(usize);

/// Where sink rows end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkBackend {
    /// One file per sink name under the directory.
    Directory(PathBuf),
    /// Rows are kept in memory, for tests and dry runs.
    Memory,
}

enum SinkTarget {
    File(LineWriter<File>),
    Memory(Vec<String>),
}

struct Sink {
    name: String,
    target: SinkTarget,
    rows: u64,
}

pub struct SinkRegistry {
    backend: SinkBackend,
    sinks: Vec<Sink>,
    by_name: BTreeMap<String, SinkId>,
}

impl SinkRegistry {
    pub fn new(backend: SinkBackend) -> Self {
        SinkRegistry {
            backend,
            sinks: Vec::new(),
            by_name: BTreeMap::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(SinkBackend::Memory)
    }

    pub fn backend(&self) -> &SinkBackend {
        &self.backend
    }

    /// Opens (or returns the already open) sink called `name`.
    pub fn open(&mut self, name: &str) -> Result<SinkId, SinkError> {
        if let Some(id) = self.by_name.get(name) {
            return Ok(*id);
        }

        let target = match &self.backend {
            SinkBackend::Memory => SinkTarget::Memory(Vec::new()),
            SinkBackend::Directory(dir) => {
                let path = dir.join(name);
                SinkTarget::File(LineWriter::new(create_file(&path).map_err(|source| {
                    SinkError::Open {
                        name: name.to_string(),
                        source,
                    }
                })?))
            }
        };

        let id = SinkId(self.sinks.len());
        self.sinks.push(Sink {
            name: name.to_string(),
            target,
            rows: 0,
        });
        self.by_name.insert(name.to_string(), id);
        tracing::debug!(sink = name, "opened sink");
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Option<SinkId> {
        self.by_name.get(name).copied()
    }

    /// Appends one row. `row` must not contain a newline.
    pub fn write_row(&mut self, id: SinkId, row: &str) -> Result<(), SinkError> {
        let sink = &mut self.sinks[id.0];
        match &mut sink.target {
            SinkTarget::Memory(rows) => rows.push(row.to_string()),
            SinkTarget::File(w) => {
                writeln!(w, "{row}").map_err(|source| SinkError::Io {
                    name: sink.name.clone(),
                    source,
                })?;
            }
        }
        sink.rows += 1;
        Ok(())
    }

    /// Opens `name` if needed and appends one row.
    pub fn write_named(&mut self, name: &str, row: &str) -> Result<(), SinkError> {
        let id = self.open(name)?;
        self.write_row(id, row)
    }

    /// Rows held by a memory sink. `None` for unknown or file-backed sinks.
    pub fn rows(&self, name: &str) -> Option<&[String]> {
        let id = self.by_name.get(name)?;
        match &self.sinks[id.0].target {
            SinkTarget::Memory(rows) => Some(rows),
            SinkTarget::File(_) => None,
        }
    }

    pub fn row_count(&self, name: &str) -> u64 {
        self.by_name
            .get(name)
            .map_or(0, |id| self.sinks[id.0].rows)
    }

    /// Sink names in lexical order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    pub fn flush_all(&mut self) -> Result<(), SinkError> {
        for sink in &mut self.sinks {
            if let SinkTarget::File(w) = &mut sink.target {
                w.flush().map_err(|source| SinkError::Io {
                    name: sink.name.clone(),
                    source,
                })?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkRegistry")
            .field("backend", &self.backend)
            .field("sinks", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn create_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    File::create(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_name_same_sink() {
        let mut sinks = SinkRegistry::in_memory();
        let a = sinks.open("server-rtt-5.txt").unwrap();
        let b = sinks.open("server-rtt-5.txt").unwrap();
        assert_eq!(a, b);
        assert_eq!(sinks.names().count(), 1);
    }

    #[test]
    fn memory_rows_in_order() {
        let mut sinks = SinkRegistry::in_memory();
        sinks.write_named("x", "1\ta").unwrap();
        sinks.write_named("x", "2\tb").unwrap();
        assert_eq!(sinks.rows("x").unwrap(), ["1\ta", "2\tb"]);
        assert_eq!(sinks.row_count("x"), 2);
        assert_eq!(sinks.row_count("missing"), 0);
        assert!(sinks.rows("missing").is_none());
    }

    #[test]
    fn directory_backend_writes_lines() {
        let dir = std::env::temp_dir().join(format!("netlab-sink-{}", std::process::id()));
        let mut sinks = SinkRegistry::new(SinkBackend::Directory(dir.clone()));
        sinks.write_named("nested/rows.txt", "0.5\t1400").unwrap();
        sinks.flush_all().unwrap();

        let content = fs::read_to_string(dir.join("nested/rows.txt")).unwrap();
        assert_eq!(content, "0.5\t1400\n");
        let _ = fs::remove_dir_all(dir);
    }
}
