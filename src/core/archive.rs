//! Archive/index generator.
//!
//! Packs a finished categorized corpus into gzip blobs plus an SQLite index
//! mapping each object to `(blob, offset, size)` in the uncompressed blob.
//! Offsets point at the record header; `size` covers the header and body but
//! not the blank separator line that follows each record. Identical corpora
//! produce identical blobs and, apart from `meta.generated_at`, an identical
//! index file.
//!
//! The index also carries browse tables: the class hierarchy with each
//! class's ancestor set, and the object name tree with the classes shown
//! under every node.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use bstr::ByteSlice;
use clap::ValueEnum;
use flate2::write::GzEncoder;
use owo_colors::OwoColorize;
use rayon::prelude::*;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::cli::{AppContext, ArchiveArgs};
use crate::core::browse::{ClassHierarchy, ClassLink, ObjectTree};
use crate::core::categorize::{SCRUB_HITS_FILE, load_known_hits};
use crate::core::corpus::{CorpusEntry, CorpusFile, list_class_files};
use crate::core::diagnostics::PhaseDiagnostics;
use crate::infra::config::load_config;
use crate::infra::io::{create_gz_writer, finish_gz_writer, open_log};
use crate::infra::output::{OutputGuard, ensure_complete};
use crate::infra::utils::{NameUtils, ProgressUtils};

pub const INDEX_FILE: &str = "index.sqlite";
pub const BLOB_DIR: &str = "blobs";
pub const ARCHIVE_FORMAT: &str = "dumpsieve-archive-1";

pub const FLAG_SCRUBBED: u32 = 1;
pub const FLAG_DEFAULT_OBJECT: u32 = 1 << 1;

const ARCHETYPE_KEY: &[u8] = b"ObjectArchetype=";

/// How class content is split into blobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BlobLayout {
    /// `<Class>.dump.<N>.gz`, rolled over at `max_blob_bytes`
    #[default]
    PerClass,
    /// `<Class>.<seq>.gz`, one object each
    PerObject,
}

impl BlobLayout {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PerClass => "per-class",
            Self::PerObject => "per-object",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub layout: BlobLayout,
    pub max_blob_bytes: u64,
    /// Stored in `meta.generated_at`; now when unset
    pub generated_at: Option<String>,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            layout: BlobLayout::PerClass,
            max_blob_bytes: 15 * 1024 * 1024,
            generated_at: None,
        }
    }
}

/// The index does not faithfully describe the corpus. Always fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArchiveConsistencyViolation {
    #[error("object {name} of class {class} is not reachable through the index")]
    Unreachable { class: String, name: String },

    #[error("object {name} resolves to {found} instead of {expected}")]
    Misplaced {
        name: String,
        expected: String,
        found: String,
    },

    #[error("index holds {indexed} objects, corpus holds {expected}")]
    CountMismatch { indexed: u64, expected: u64 },

    #[error("blob {blob} referenced by the index does not exist")]
    MissingBlob { blob: String },

    #[error("{node} records {recorded} children, index links {actual}")]
    ChildCountMismatch {
        node: String,
        recorded: u64,
        actual: u64,
    },

    #[error("object {name} of class {class} cannot be reached through the browse tree")]
    Unbrowsable { class: String, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PackedObject {
    name: String,
    blob_ref: String,
    offset: u64,
    size: u64,
    flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PackedClass {
    name: String,
    parent: Option<String>,
    blobs: Vec<String>,
    objects: Vec<PackedObject>,
}

/// Parent class named by a default object's archetype line, e.g.
/// `  ObjectArchetype=Actor'Engine.Default__Actor'` → `Actor`.
fn archetype_parent(body: &[u8]) -> Option<String> {
    body.lines().find_map(|line| {
        let value = line.trim_start().strip_prefix(ARCHETYPE_KEY)?;
        let class = value.split_str("'").next().unwrap_or_default().trim();
        if class.is_empty() || class.eq_ignore_ascii_case(b"none") {
            None
        } else {
            Some(class.to_str_lossy().into_owned())
        }
    })
}

struct BlobWriter {
    dir: PathBuf,
    current: Option<GzEncoder<io::BufWriter<fs::File>>>,
    pos: u64,
}

impl BlobWriter {
    fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            current: None,
            pos: 0,
        }
    }

    fn start(&mut self, blob_ref: &str) -> Result<()> {
        self.close()?;
        self.current = Some(create_gz_writer(self.dir.join(blob_ref))?);
        self.pos = 0;
        Ok(())
    }

    /// Append one record and its separator; returns the record offset.
    fn append(&mut self, record: &[u8]) -> Result<u64> {
        let writer = self.current.as_mut().context("no blob open")?;
        writer.write_all(record)?;
        writer.write_all(b"\n")?;
        let offset = self.pos;
        self.pos += record.len() as u64 + 1;
        Ok(offset)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(w) = self.current.take() {
            finish_gz_writer(w)?;
        }
        Ok(())
    }
}

fn pack_class(
    class: &str,
    path: &Path,
    blob_dir: &Path,
    opts: &ArchiveOptions,
    scrubbed: &HashSet<String>,
) -> Result<PackedClass> {
    let mut packed = PackedClass {
        name: class.to_string(),
        parent: None,
        blobs: Vec::new(),
        objects: Vec::new(),
    };
    let mut blobs = BlobWriter::new(blob_dir);

    for entry in CorpusFile::open(path)? {
        let entry = entry?;
        let record = entry.record();

        let rollover = match opts.layout {
            BlobLayout::PerClass => blobs.current.is_none() || blobs.pos >= opts.max_blob_bytes,
            BlobLayout::PerObject => true,
        };
        if rollover {
            let n = packed.blobs.len() + 1;
            let blob_ref = match opts.layout {
                BlobLayout::PerClass => format!("{class}.dump.{n}.gz"),
                BlobLayout::PerObject => format!("{class}.{n}.gz"),
            };
            blobs.start(&blob_ref)?;
            packed.blobs.push(blob_ref);
        }
        let offset = blobs.append(&record)?;

        let is_default = NameUtils::is_default_object(&entry.name);
        if is_default && packed.parent.is_none() {
            packed.parent = archetype_parent(&entry.body);
        }
        let mut flags = 0;
        if scrubbed.contains(&NameUtils::key(&entry.name)) {
            flags |= FLAG_SCRUBBED;
        }
        if is_default {
            flags |= FLAG_DEFAULT_OBJECT;
        }

        packed.objects.push(PackedObject {
            name: entry.name,
            blob_ref: packed.blobs.last().cloned().unwrap_or_default(),
            offset,
            size: record.len() as u64,
            flags,
        });
    }
    blobs.close()?;
    debug!(class, objects = packed.objects.len(), blobs = packed.blobs.len(), "class packed");
    Ok(packed)
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE classes (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            blob_ref TEXT,
            num_blobs INTEGER NOT NULL,
            num_objects INTEGER NOT NULL,
            parent TEXT,
            parent_id INTEGER REFERENCES classes (id),
            num_children INTEGER NOT NULL DEFAULT 0,
            total_children INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE class_children (
            parent INTEGER NOT NULL REFERENCES classes (id),
            child INTEGER NOT NULL REFERENCES classes (id),
            UNIQUE (parent, child)
        );
        CREATE TABLE class_aggregate (
            id INTEGER NOT NULL REFERENCES classes (id),
            aggregate INTEGER NOT NULL REFERENCES classes (id),
            UNIQUE (id, aggregate)
        );
        CREATE TABLE objects (
            id INTEGER PRIMARY KEY,
            class INTEGER NOT NULL REFERENCES classes (id),
            name TEXT NOT NULL,
            name_key TEXT NOT NULL,
            blob_ref TEXT NOT NULL,
            offset INTEGER NOT NULL,
            size INTEGER NOT NULL,
            flags INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX idx_objects_name_key ON objects (name_key);
        CREATE INDEX idx_objects_class ON objects (class);
        CREATE TABLE object_tree (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            name_key TEXT NOT NULL UNIQUE,
            short_name TEXT NOT NULL,
            separator TEXT,
            parent INTEGER REFERENCES object_tree (id),
            object INTEGER REFERENCES objects (id),
            class INTEGER REFERENCES classes (id),
            num_children INTEGER NOT NULL DEFAULT 0,
            total_children INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX idx_object_tree_parent ON object_tree (parent);
        CREATE TABLE object_children (
            parent INTEGER NOT NULL REFERENCES object_tree (id),
            child INTEGER NOT NULL REFERENCES object_tree (id),
            UNIQUE (parent, child)
        );
        CREATE TABLE object_show_class_ids (
            id INTEGER NOT NULL REFERENCES object_tree (id),
            class INTEGER NOT NULL REFERENCES classes (id),
            has_children INTEGER NOT NULL DEFAULT 0,
            UNIQUE (id, class)
        );
        CREATE TABLE meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    )
    .context("Failed to create index schema")
}

/// Class hierarchy and name tree over the packed classes, in index order.
fn build_browse(classes: &[PackedClass]) -> (ClassHierarchy, ObjectTree) {
    let links: Vec<ClassLink<'_>> = classes
        .iter()
        .map(|c| ClassLink {
            name: &c.name,
            parent: c.parent.as_deref(),
            objects: c.objects.len() as u64,
        })
        .collect();
    let hierarchy = ClassHierarchy::build(&links);

    let mut tree = ObjectTree::default();
    for (ci, class) in classes.iter().enumerate() {
        for (oi, obj) in class.objects.iter().enumerate() {
            if !tree.insert(&obj.name, (ci, oi)) {
                debug!(class = %class.name, name = %obj.name, "name already in browse tree");
            }
        }
    }
    tree.finish(&hierarchy);
    (hierarchy, tree)
}

/// Row id of the class at `pos` in the packed list.
fn class_id(pos: usize) -> i64 {
    pos as i64 + 1
}

fn write_index(
    path: &Path,
    classes: &[PackedClass],
    browse: &(ClassHierarchy, ObjectTree),
    opts: &ArchiveOptions,
    generated_at: &str,
) -> Result<()> {
    let (hierarchy, tree) = browse;
    let mut conn =
        Connection::open(path).with_context(|| format!("Failed to create {}", path.display()))?;
    create_schema(&conn)?;

    let tx = conn.transaction()?;
    {
        let mut insert_class = tx.prepare(
            "INSERT INTO classes (id, name, blob_ref, num_blobs, num_objects, parent, parent_id, num_children, total_children)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        let mut insert_object = tx.prepare(
            "INSERT INTO objects (class, name, name_key, blob_ref, offset, size, flags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        let mut object_ids: Vec<Vec<i64>> = Vec::with_capacity(classes.len());
        for (pos, class) in classes.iter().enumerate() {
            insert_class.execute(params![
                class_id(pos),
                class.name,
                class.blobs.first(),
                class.blobs.len() as i64,
                class.objects.len() as i64,
                class.parent,
                hierarchy.parent[pos].map(class_id),
                hierarchy.children[pos].len() as i64,
                hierarchy.total_objects[pos] as i64,
            ])?;
            let mut ids = Vec::with_capacity(class.objects.len());
            for obj in &class.objects {
                insert_object.execute(params![
                    class_id(pos),
                    obj.name,
                    NameUtils::key(&obj.name),
                    obj.blob_ref,
                    obj.offset as i64,
                    obj.size as i64,
                    obj.flags,
                ])?;
                ids.push(tx.last_insert_rowid());
            }
            object_ids.push(ids);
        }

        let mut insert_class_child = tx.prepare("INSERT INTO class_children (parent, child) VALUES (?1, ?2)")?;
        let mut insert_aggregate = tx.prepare("INSERT INTO class_aggregate (id, aggregate) VALUES (?1, ?2)")?;
        for pos in 0..classes.len() {
            for &child in &hierarchy.children[pos] {
                insert_class_child.execute(params![class_id(pos), class_id(child)])?;
            }
            for ancestor in hierarchy.aggregate(pos) {
                insert_aggregate.execute(params![class_id(pos), class_id(ancestor)])?;
            }
        }

        let order = tree.preorder();
        let mut node_ids = vec![0i64; tree.nodes.len()];
        for (n, &idx) in order.iter().enumerate() {
            node_ids[idx] = n as i64 + 1;
        }
        let mut insert_node = tx.prepare(
            "INSERT INTO object_tree (id, name, name_key, short_name, separator, parent, object, class, num_children, total_children)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?;
        let mut insert_node_child = tx.prepare("INSERT INTO object_children (parent, child) VALUES (?1, ?2)")?;
        let mut insert_shown =
            tx.prepare("INSERT INTO object_show_class_ids (id, class, has_children) VALUES (?1, ?2, ?3)")?;
        for &idx in &order {
            let node = &tree.nodes[idx];
            insert_node.execute(params![
                node_ids[idx],
                node.name,
                NameUtils::key(&node.name),
                node.short_name,
                node.separator.map(String::from),
                node.parent.map(|p| node_ids[p]),
                node.object.map(|(ci, oi)| object_ids[ci][oi]),
                node.object.map(|(ci, _)| class_id(ci)),
                node.children.len() as i64,
                node.total_children as i64,
            ])?;
            for &child in &node.children {
                insert_node_child.execute(params![node_ids[idx], node_ids[child]])?;
            }
            for (&class, &has_children) in &node.show_classes {
                insert_shown.execute(params![node_ids[idx], class_id(class), has_children])?;
            }
        }

        let total: usize = classes.iter().map(|c| c.objects.len()).sum();
        let mut insert_meta = tx.prepare("INSERT INTO meta (key, value) VALUES (?1, ?2)")?;
        for (key, value) in [
            ("format", ARCHIVE_FORMAT.to_string()),
            ("layout", opts.layout.as_str().to_string()),
            ("max_blob_bytes", opts.max_blob_bytes.to_string()),
            ("num_classes", classes.len().to_string()),
            ("num_objects", total.to_string()),
            ("num_tree_nodes", tree.nodes.len().to_string()),
            ("generated_at", generated_at.to_string()),
        ] {
            insert_meta.execute(params![key, value])?;
        }
    }
    tx.commit().context("Failed to commit archive index")?;
    Ok(())
}

fn verify(archive: &Path, classes: &[PackedClass]) -> Result<u64> {
    let reader = ArchiveReader::open_unchecked(archive)?;

    let expected: u64 = classes.iter().map(|c| c.objects.len() as u64).sum();
    let indexed = reader.object_count()?;
    if indexed != expected {
        return Err(ArchiveConsistencyViolation::CountMismatch { indexed, expected }.into());
    }

    for blob in reader.blob_refs()? {
        if !reader.blob_path(&blob).is_file() {
            return Err(ArchiveConsistencyViolation::MissingBlob { blob }.into());
        }
    }

    let mut verified = 0;
    for class in classes {
        for obj in &class.objects {
            let Some(found) = reader.lookup(&obj.name)? else {
                return Err(ArchiveConsistencyViolation::Unreachable {
                    class: class.name.clone(),
                    name: obj.name.clone(),
                }
                .into());
            };
            if found.class_name != class.name || found.blob_ref != obj.blob_ref || found.offset != obj.offset {
                return Err(ArchiveConsistencyViolation::Misplaced {
                    name: obj.name.clone(),
                    expected: format!("{}@{}+{}", obj.blob_ref, obj.offset, class.name),
                    found: format!("{}@{}+{}", found.blob_ref, found.offset, found.class_name),
                }
                .into());
            }
            match reader.node(&obj.name)? {
                Some(node) if node.class_name.as_deref() == Some(class.name.as_str()) => {}
                _ => {
                    return Err(ArchiveConsistencyViolation::Unbrowsable {
                        class: class.name.clone(),
                        name: obj.name.clone(),
                    }
                    .into());
                }
            }
            verified += 1;
        }
    }
    check_browse_tables(&reader)?;
    Ok(verified)
}

/// Recorded child counts match the link tables, and every dumped node is
/// shown under its own class.
fn check_browse_tables(reader: &ArchiveReader) -> Result<()> {
    for sql in [
        "SELECT c.name, c.num_children, (SELECT COUNT(*) FROM class_children k WHERE k.parent = c.id) AS linked
         FROM classes c WHERE c.num_children != linked ORDER BY c.id LIMIT 1",
        "SELECT t.name, t.num_children, (SELECT COUNT(*) FROM object_children k WHERE k.parent = t.id) AS linked
         FROM object_tree t WHERE t.num_children != linked ORDER BY t.id LIMIT 1",
    ] {
        let mismatch = reader
            .conn
            .query_row(sql, [], |row| {
                Ok(ArchiveConsistencyViolation::ChildCountMismatch {
                    node: row.get(0)?,
                    recorded: row.get::<_, i64>(1)? as u64,
                    actual: row.get::<_, i64>(2)? as u64,
                })
            })
            .optional()?;
        if let Some(violation) = mismatch {
            return Err(violation.into());
        }
    }

    let hidden = reader
        .conn
        .query_row(
            "SELECT c.name, t.name FROM object_tree t JOIN classes c ON t.class = c.id
             WHERE NOT EXISTS (SELECT 1 FROM object_show_class_ids s WHERE s.id = t.id AND s.class = t.class)
             ORDER BY t.id LIMIT 1",
            [],
            |row| {
                Ok(ArchiveConsistencyViolation::Unbrowsable {
                    class: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .optional()?;
    match hidden {
        Some(violation) => Err(violation.into()),
        None => Ok(()),
    }
}

fn clear_previous_archive(out_dir: &Path) -> Result<()> {
    let blob_dir = out_dir.join(BLOB_DIR);
    if blob_dir.exists() {
        fs::remove_dir_all(&blob_dir)
            .with_context(|| format!("Failed to clear {}", blob_dir.display()))?;
    }
    let index = out_dir.join(INDEX_FILE);
    if index.exists() {
        fs::remove_file(&index).with_context(|| format!("Failed to remove {}", index.display()))?;
    }
    Ok(())
}

/// Package `corpus_dir` into `out_dir`. On any failure the output keeps its
/// incomplete marker.
#[instrument(skip_all, fields(corpus = %corpus_dir.display(), out = %out_dir.display()))]
pub fn generate(corpus_dir: &Path, out_dir: &Path, opts: &ArchiveOptions, diag: &mut PhaseDiagnostics) -> Result<()> {
    ensure_complete(corpus_dir)?;
    if opts.max_blob_bytes == 0 {
        bail!("max_blob_bytes must be at least 1");
    }
    let same_dir = match (corpus_dir.canonicalize(), out_dir.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };
    if same_dir {
        bail!("archive output must differ from the corpus directory");
    }

    let class_files = list_class_files(corpus_dir)?;
    let hits_path = corpus_dir.join(SCRUB_HITS_FILE);
    let scrubbed: HashSet<String> = if hits_path.is_file() {
        load_known_hits(&hits_path)?
            .into_iter()
            .map(|(object, _)| NameUtils::key(&object))
            .collect()
    } else {
        HashSet::new()
    };

    let guard = OutputGuard::begin(out_dir, "archive")?;
    let result: Result<()> = (|| {
        clear_previous_archive(out_dir)?;
        let blob_dir = out_dir.join(BLOB_DIR);
        fs::create_dir_all(&blob_dir)
            .with_context(|| format!("Failed to create {}", blob_dir.display()))?;

        let classes: Vec<PackedClass> = class_files
            .par_iter()
            .map(|(class, path)| pack_class(class, path, &blob_dir, opts, &scrubbed))
            .collect::<Result<_>>()?;

        let generated_at = opts
            .generated_at
            .clone()
            .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());
        let browse = build_browse(&classes);
        write_index(&out_dir.join(INDEX_FILE), &classes, &browse, opts, &generated_at)?;
        diag.set("tree_nodes", browse.1.nodes.len() as u64);

        diag.set("classes", classes.len() as u64);
        diag.set("objects", classes.iter().map(|c| c.objects.len() as u64).sum());
        diag.set("blobs", classes.iter().map(|c| c.blobs.len() as u64).sum());
        diag.set("parents_resolved", classes.iter().filter(|c| c.parent.is_some()).count() as u64);
        let flagged = |flag: u32| {
            classes
                .iter()
                .flat_map(|c| &c.objects)
                .filter(|o| o.flags & flag != 0)
                .count() as u64
        };
        diag.set("scrubbed_objects", flagged(FLAG_SCRUBBED));
        diag.set("default_objects", flagged(FLAG_DEFAULT_OBJECT));

        let verified = verify(out_dir, &classes)?;
        diag.set("verified", verified);
        Ok(())
    })();

    match result {
        Ok(()) => {
            guard.complete()?;
            info!(classes = diag.get("classes"), objects = diag.get("objects"), "archive written");
            Ok(())
        }
        Err(e) => {
            if let Some(violation) = e.downcast_ref::<ArchiveConsistencyViolation>() {
                diag.fail(violation.to_string());
                diag.add("consistency_failures", 1);
            }
            guard.abandon(&format!("{e:#}"));
            Err(e)
        }
    }
}

/// Location of one object inside a packaged archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedObject {
    pub class_name: String,
    pub name: String,
    pub blob_ref: String,
    pub offset: u64,
    pub size: u64,
    pub flags: u32,
}

impl IndexedObject {
    pub fn is_scrubbed(&self) -> bool {
        self.flags & FLAG_SCRUBBED != 0
    }

    pub fn is_default_object(&self) -> bool {
        self.flags & FLAG_DEFAULT_OBJECT != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedClass {
    pub name: String,
    pub parent: Option<String>,
    pub num_blobs: u64,
    pub num_objects: u64,
    pub num_subclasses: u64,
    /// Objects of this class or any archived subclass
    pub total_objects: u64,
}

/// One node of the object name tree. Folder nodes have no class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseNode {
    pub name: String,
    pub short_name: String,
    pub class_name: Option<String>,
    pub num_children: u64,
    pub total_children: u64,
    /// Expanding the node shows at least one child
    pub expandable: bool,
}

const NODE_SELECT: &str = "SELECT t.name, t.short_name, c.name, t.num_children, t.total_children";

fn browse_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<BrowseNode> {
    Ok(BrowseNode {
        name: row.get(0)?,
        short_name: row.get(1)?,
        class_name: row.get(2)?,
        num_children: row.get::<_, i64>(3)? as u64,
        total_children: row.get::<_, i64>(4)? as u64,
        expandable: row.get::<_, i64>(5)? != 0,
    })
}

/// Read access to a finished archive.
pub struct ArchiveReader {
    dir: PathBuf,
    conn: Connection,
}

impl ArchiveReader {
    /// Open an archive; refuses one still marked incomplete.
    pub fn open(dir: &Path) -> Result<Self> {
        ensure_complete(dir)?;
        Self::open_unchecked(dir)
    }

    fn open_unchecked(dir: &Path) -> Result<Self> {
        let path = dir.join(INDEX_FILE);
        let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("Failed to open index {}", path.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            conn,
        })
    }

    pub fn blob_path(&self, blob_ref: &str) -> PathBuf {
        self.dir.join(BLOB_DIR).join(blob_ref)
    }

    pub fn meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?)
    }

    pub fn object_count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM objects", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Case-insensitive lookup by qualified name.
    pub fn lookup(&self, name: &str) -> Result<Option<IndexedObject>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT c.name, o.name, o.blob_ref, o.offset, o.size, o.flags
             FROM objects o JOIN classes c ON o.class = c.id
             WHERE o.name_key = ?1 ORDER BY o.id LIMIT 1",
        )?;
        let found = stmt
            .query_row(params![NameUtils::key(name)], |row| {
                Ok(IndexedObject {
                    class_name: row.get(0)?,
                    name: row.get(1)?,
                    blob_ref: row.get(2)?,
                    offset: row.get::<_, i64>(3)? as u64,
                    size: row.get::<_, i64>(4)? as u64,
                    flags: row.get(5)?,
                })
            })
            .optional()?;
        Ok(found)
    }

    pub fn classes(&self) -> Result<Vec<IndexedClass>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, parent, num_blobs, num_objects, num_children, total_children FROM classes ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(IndexedClass {
                name: row.get(0)?,
                parent: row.get(1)?,
                num_blobs: row.get::<_, i64>(2)? as u64,
                num_objects: row.get::<_, i64>(3)? as u64,
                num_subclasses: row.get::<_, i64>(4)? as u64,
                total_objects: row.get::<_, i64>(5)? as u64,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Direct subclasses of `class`, by name.
    pub fn subclasses(&self, class: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT k.name FROM classes c
             JOIN class_children cc ON cc.parent = c.id
             JOIN classes k ON k.id = cc.child
             WHERE c.name = ?1 ORDER BY k.id",
        )?;
        let rows = stmt.query_map(params![class], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Tree node for a qualified name or one of its prefixes.
    pub fn node(&self, name: &str) -> Result<Option<BrowseNode>> {
        let sql = format!(
            "{NODE_SELECT}, t.num_children > 0 FROM object_tree t LEFT JOIN classes c ON t.class = c.id
             WHERE t.name_key = ?1"
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        Ok(stmt.query_row(params![NameUtils::key(name)], browse_node).optional()?)
    }

    /// Children of `parent` in the name tree; top-level nodes for `None`.
    pub fn children(&self, parent: Option<&str>) -> Result<Vec<BrowseNode>> {
        let sql = format!(
            "{NODE_SELECT}, t.num_children > 0 FROM object_tree t LEFT JOIN classes c ON t.class = c.id
             WHERE (?1 IS NULL AND t.parent IS NULL)
                OR t.parent = (SELECT id FROM object_tree WHERE name_key = ?1)
             ORDER BY t.id"
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![parent.map(NameUtils::key)], browse_node)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Children of `parent` that hold an object of `class` or of one of its
    /// subclasses, at or below them. `expandable` tells whether such an
    /// object sits further down.
    pub fn browse(&self, class: &str, parent: Option<&str>) -> Result<Vec<BrowseNode>> {
        let sql = format!(
            "{NODE_SELECT}, s.has_children FROM object_tree t
             JOIN object_show_class_ids s ON s.id = t.id
             LEFT JOIN classes c ON t.class = c.id
             WHERE s.class = (SELECT id FROM classes WHERE name = ?1)
               AND ((?2 IS NULL AND t.parent IS NULL)
                    OR t.parent = (SELECT id FROM object_tree WHERE name_key = ?2))
             ORDER BY t.id"
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![class, parent.map(NameUtils::key)], browse_node)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Distinct blobs in index order.
    pub fn blob_refs(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT blob_ref FROM objects GROUP BY blob_ref ORDER BY MIN(id)")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// The exact stored record (header line and body) of `obj`.
    pub fn read_object(&self, obj: &IndexedObject) -> Result<Vec<u8>> {
        let path = self.blob_path(&obj.blob_ref);
        let mut input = open_log(&path)?;
        let skipped = io::copy(&mut input.by_ref().take(obj.offset), &mut io::sink())
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if skipped != obj.offset {
            bail!("{} ends before offset {}", path.display(), obj.offset);
        }
        let mut record = vec![0; obj.size as usize];
        input
            .read_exact(&mut record)
            .with_context(|| format!("{} is shorter than its index entry for {}", path.display(), obj.name))?;
        Ok(record)
    }

    /// Look up and read in one step.
    pub fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.lookup(name)?.map(|obj| self.read_object(&obj)).transpose()
    }

    /// Visit every archived object, blob by blob.
    pub fn for_each_entry<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(CorpusEntry) -> Result<()>,
    {
        for blob in self.blob_refs()? {
            for entry in CorpusFile::open(&self.blob_path(&blob))? {
                f(entry?)?;
            }
        }
        Ok(())
    }
}

pub fn run(args: ArchiveArgs, ctx: &AppContext) -> Result<()> {
    let config = load_config(ctx.config_path.as_deref())?.archive;
    let opts = ArchiveOptions {
        layout: args.layout.unwrap_or(config.layout),
        max_blob_bytes: args.max_blob_bytes.unwrap_or(config.max_blob_bytes),
        generated_at: args.generated_at.clone(),
    };

    if ctx.dry_run {
        if !ctx.quiet {
            println!(
                "{} {} -> {} ({} layout)",
                "DRY RUN: Would archive".yellow(),
                args.corpus.display(),
                args.out.display(),
                opts.layout.as_str()
            );
        }
        return Ok(());
    }

    let mut diag = PhaseDiagnostics::new("archive");
    let spinner = ProgressUtils::spinner(ctx, "packing classes");
    let result = generate(&args.corpus, &args.out, &opts, &mut diag);
    spinner.finish_and_clear();

    match &result {
        Ok(()) => diag.mark_complete(),
        Err(e) => diag.record_error(e),
    }
    diag.emit(ctx, args.diagnostics.as_deref())?;

    if result.is_ok() && !ctx.quiet {
        let line = format!(
            "Archived {} objects in {} classes to {}",
            diag.get("objects"),
            diag.get("classes"),
            args.out.display()
        );
        if ctx.no_color {
            println!("{line}");
        } else {
            println!("{}", line.green());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::output::{INCOMPLETE_MARKER, is_incomplete};
    use tempfile::TempDir;

    fn corpus(dir: &Path) {
        fs::create_dir_all(dir).unwrap();
        fs::write(
            dir.join("Foo.dump"),
            "\
*** Property dump for object 'Foo GD_Foo.Default__Foo' ***
  ObjectArchetype=Bar'Core.Default__Bar'

*** Property dump for object 'Foo GD_Foo.Bar_1' ***
  Value=1
  Secret=<hidden>

*** Property dump for object 'Foo GD_Foo.Empty' ***

",
        )
        .unwrap();
        fs::write(
            dir.join("Bar.dump"),
            "*** Property dump for object 'Bar GD_Bar.One' ***\n  X=2\n\n",
        )
        .unwrap();
        fs::write(dir.join(SCRUB_HITS_FILE), "GD_Foo.Bar_1\trule-1\n").unwrap();
    }

    fn fixed_opts(layout: BlobLayout) -> ArchiveOptions {
        ArchiveOptions {
            layout,
            max_blob_bytes: 15 * 1024 * 1024,
            generated_at: Some("2020-01-01T00:00:00+00:00".into()),
        }
    }

    #[test]
    fn archive_round_trips_records() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("corpus");
        let out = tmp.path().join("archive");
        corpus(&src);

        let mut diag = PhaseDiagnostics::new("archive");
        generate(&src, &out, &fixed_opts(BlobLayout::PerClass), &mut diag).unwrap();
        assert!(!is_incomplete(&out));
        assert_eq!(diag.get("objects"), 4);
        assert_eq!(diag.get("verified"), 4);

        let reader = ArchiveReader::open(&out).unwrap();
        let obj = reader.lookup("gd_foo.bar_1").unwrap().unwrap();
        assert_eq!(obj.class_name, "Foo");
        assert!(obj.is_scrubbed());
        assert_eq!(
            reader.read_object(&obj).unwrap(),
            b"*** Property dump for object 'Foo GD_Foo.Bar_1' ***\n  Value=1\n  Secret=<hidden>\n".to_vec()
        );
        assert_eq!(
            reader.get("GD_Foo.Empty").unwrap().unwrap(),
            b"*** Property dump for object 'Foo GD_Foo.Empty' ***\n".to_vec()
        );
        assert!(reader.lookup("GD_Foo.Nope").unwrap().is_none());

        let default = reader.lookup("GD_Foo.Default__Foo").unwrap().unwrap();
        assert!(default.is_default_object());

        let classes = reader.classes().unwrap();
        assert_eq!(classes[0].name, "Bar");
        assert_eq!(classes[1].parent.as_deref(), Some("Bar"));
        assert_eq!(reader.meta("layout").unwrap().as_deref(), Some("per-class"));

        let mut names = Vec::new();
        reader.for_each_entry(|e| Ok(names.push(e.name))).unwrap();
        assert_eq!(names.len(), 4);
    }

    #[test]
    fn identical_corpus_gives_identical_index() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("corpus");
        corpus(&src);

        let mut outputs = Vec::new();
        for n in 0..2 {
            let out = tmp.path().join(format!("archive{n}"));
            let mut diag = PhaseDiagnostics::new("archive");
            generate(&src, &out, &fixed_opts(BlobLayout::PerClass), &mut diag).unwrap();
            outputs.push(out);
        }
        let read = |dir: &Path, rel: &str| fs::read(dir.join(rel)).unwrap();
        assert_eq!(read(&outputs[0], INDEX_FILE), read(&outputs[1], INDEX_FILE));
        assert_eq!(
            read(&outputs[0], "blobs/Foo.dump.1.gz"),
            read(&outputs[1], "blobs/Foo.dump.1.gz")
        );
    }

    #[test]
    fn per_object_layout_and_rollover() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("corpus");
        corpus(&src);

        let out = tmp.path().join("per-object");
        let mut diag = PhaseDiagnostics::new("archive");
        generate(&src, &out, &fixed_opts(BlobLayout::PerObject), &mut diag).unwrap();
        assert_eq!(diag.get("blobs"), 4);
        let reader = ArchiveReader::open(&out).unwrap();
        let obj = reader.lookup("GD_Foo.Empty").unwrap().unwrap();
        assert_eq!(obj.blob_ref, "Foo.3.gz");
        assert_eq!(obj.offset, 0);

        let out = tmp.path().join("tiny-blobs");
        let mut opts = fixed_opts(BlobLayout::PerClass);
        opts.max_blob_bytes = 1;
        let mut diag = PhaseDiagnostics::new("archive");
        generate(&src, &out, &opts, &mut diag).unwrap();
        let reader = ArchiveReader::open(&out).unwrap();
        assert_eq!(reader.lookup("GD_Foo.Empty").unwrap().unwrap().blob_ref, "Foo.dump.3.gz");
    }

    #[test]
    fn incomplete_corpus_and_archive_are_refused() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("corpus");
        corpus(&src);
        fs::write(src.join(INCOMPLETE_MARKER), "phase=categorize\n").unwrap();

        let out = tmp.path().join("archive");
        let mut diag = PhaseDiagnostics::new("archive");
        assert!(generate(&src, &out, &fixed_opts(BlobLayout::PerClass), &mut diag).is_err());

        fs::remove_file(src.join(INCOMPLETE_MARKER)).unwrap();
        generate(&src, &out, &fixed_opts(BlobLayout::PerClass), &mut diag).unwrap();
        fs::write(out.join(INCOMPLETE_MARKER), "").unwrap();
        assert!(ArchiveReader::open(&out).is_err());
    }

    #[test]
    fn misplaced_duplicate_is_a_violation() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("corpus");
        corpus(&src);
        fs::write(
            src.join("Zed.dump"),
            "*** Property dump for object 'Zed gd_bar.one' ***\n\n",
        )
        .unwrap();

        let out = tmp.path().join("archive");
        let mut diag = PhaseDiagnostics::new("archive");
        let err = generate(&src, &out, &fixed_opts(BlobLayout::PerClass), &mut diag).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ArchiveConsistencyViolation>(),
            Some(ArchiveConsistencyViolation::Misplaced { .. })
        ));
        assert!(is_incomplete(&out));
        assert_eq!(diag.get("consistency_failures"), 1);
    }

    #[test]
    fn browse_tables_follow_class_and_name_hierarchy() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("corpus");
        let out = tmp.path().join("archive");
        corpus(&src);
        let mut diag = PhaseDiagnostics::new("archive");
        generate(&src, &out, &fixed_opts(BlobLayout::PerClass), &mut diag).unwrap();
        assert_eq!(diag.get("tree_nodes"), 6);

        let reader = ArchiveReader::open(&out).unwrap();
        assert_eq!(reader.subclasses("Bar").unwrap(), vec!["Foo"]);
        assert!(reader.subclasses("Foo").unwrap().is_empty());
        let classes = reader.classes().unwrap();
        assert_eq!((classes[0].num_subclasses, classes[0].total_objects), (1, 4));
        assert_eq!((classes[1].num_subclasses, classes[1].total_objects), (0, 3));

        let roots = reader.children(None).unwrap();
        let names: Vec<&str> = roots.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["GD_Bar", "GD_Foo"]);
        assert_eq!(roots[1].class_name, None);
        assert_eq!((roots[1].num_children, roots[1].total_children), (3, 3));
        assert!(roots[1].expandable);

        let leaves = reader.children(Some("gd_foo")).unwrap();
        let shorts: Vec<&str> = leaves.iter().map(|n| n.short_name.as_str()).collect();
        assert_eq!(shorts, vec!["Bar_1", "Default__Foo", "Empty"]);
        assert!(leaves.iter().all(|n| n.class_name.as_deref() == Some("Foo") && !n.expandable));
        assert!(reader.children(Some("GD_Nowhere")).unwrap().is_empty());

        // Foo derives from Bar, so Bar shows both trees and Foo only its own
        let under_bar: Vec<String> = reader.browse("Bar", None).unwrap().into_iter().map(|n| n.name).collect();
        assert_eq!(under_bar, vec!["GD_Bar", "GD_Foo"]);
        let under_foo = reader.browse("Foo", None).unwrap();
        assert_eq!(under_foo.len(), 1);
        assert_eq!(under_foo[0].name, "GD_Foo");
        assert!(under_foo[0].expandable);
        let foo_leaves = reader.browse("Foo", Some("GD_Foo")).unwrap();
        assert_eq!(foo_leaves.len(), 3);
        assert!(foo_leaves.iter().all(|n| !n.expandable));

        let one = reader.node("gd_bar.one").unwrap().unwrap();
        assert_eq!(one.class_name.as_deref(), Some("Bar"));
        assert_eq!(one.short_name, "One");
    }

    #[test]
    fn tampered_browse_tables_are_violations() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("corpus");
        let out = tmp.path().join("archive");
        corpus(&src);
        let mut diag = PhaseDiagnostics::new("archive");
        generate(&src, &out, &fixed_opts(BlobLayout::PerClass), &mut diag).unwrap();

        let conn = Connection::open(out.join(INDEX_FILE)).unwrap();
        conn.execute("UPDATE object_tree SET num_children = 7 WHERE name_key = 'gd_foo'", [])
            .unwrap();
        let err = check_browse_tables(&ArchiveReader::open_unchecked(&out).unwrap()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ArchiveConsistencyViolation>(),
            Some(&ArchiveConsistencyViolation::ChildCountMismatch {
                node: "GD_Foo".into(),
                recorded: 7,
                actual: 3,
            })
        );

        conn.execute("UPDATE object_tree SET num_children = 3 WHERE name_key = 'gd_foo'", [])
            .unwrap();
        conn.execute(
            "DELETE FROM object_show_class_ids WHERE id = (SELECT id FROM object_tree WHERE name_key = 'gd_bar.one')",
            [],
        )
        .unwrap();
        let err = check_browse_tables(&ArchiveReader::open_unchecked(&out).unwrap()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ArchiveConsistencyViolation>(),
            Some(&ArchiveConsistencyViolation::Unbrowsable {
                class: "Bar".into(),
                name: "GD_Bar.One".into(),
            })
        );
    }

    #[test]
    fn archetype_parent_parsing() {
        assert_eq!(
            archetype_parent(b"  Foo=1\n  ObjectArchetype=Actor'Engine.Default__Actor'\n").as_deref(),
            Some("Actor")
        );
        assert_eq!(archetype_parent(b"  ObjectArchetype=None\n"), None);
        assert_eq!(archetype_parent(b"  X=1\n"), None);
    }
}
