use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bitflags::bitflags;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::rusqlite::{params, Connection, OptionalExtension};
use r2d2_sqlite::SqliteConnectionManager;

use super::xml_codec::{self, LATEX_FILENAME};
use super::{check_writable, import_with, DocType, LoadMode, PopulateReport, SaveRequest, StorageEntity};
use crate::document::content::{CodeBox, Table};
use crate::document::{
    AnchoredWidget, Document, DocumentBuilder, Justification, LoadedNode, NodeContent, NodeId, NodeProps, TextContent,
    WidgetKind,
};
use crate::errors::StorageError;
use crate::sync::{NodeState, SyncPending};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS node (
    node_id INTEGER UNIQUE,
    name TEXT,
    txt TEXT,
    syntax TEXT,
    tags TEXT,
    is_ro INTEGER,
    is_richtxt INTEGER,
    has_codebox INTEGER,
    has_table INTEGER,
    has_image INTEGER,
    level INTEGER,
    ts_creation INTEGER,
    ts_lastsave INTEGER
);
CREATE TABLE IF NOT EXISTS codebox (
    node_id INTEGER,
    offset INTEGER,
    justification TEXT,
    txt TEXT,
    syntax TEXT,
    width INTEGER,
    height INTEGER,
    is_width_pix INTEGER,
    do_highl_bra INTEGER,
    do_show_linenum INTEGER
);
CREATE TABLE IF NOT EXISTS grid (
    node_id INTEGER,
    offset INTEGER,
    justification TEXT,
    txt TEXT,
    col_min INTEGER,
    col_max INTEGER
);
CREATE TABLE IF NOT EXISTS image (
    node_id INTEGER,
    offset INTEGER,
    justification TEXT,
    anchor TEXT,
    png BLOB,
    filename TEXT,
    link TEXT,
    time INTEGER
);
CREATE TABLE IF NOT EXISTS children (
    node_id INTEGER UNIQUE,
    father_id INTEGER,
    sequence INTEGER,
    master_id INTEGER
);
CREATE TABLE IF NOT EXISTS bookmark (
    node_id INTEGER UNIQUE,
    sequence INTEGER
);";

/// Columns added by later schema versions: `(table, column, declaration)`.
const LATE_COLUMNS: &[(&str, &str, &str)] = &[
    ("node", "ts_creation", "INTEGER DEFAULT 0"),
    ("node", "ts_lastsave", "INTEGER DEFAULT 0"),
    ("image", "filename", "TEXT DEFAULT ''"),
    ("image", "link", "TEXT DEFAULT ''"),
    ("image", "time", "INTEGER DEFAULT 0"),
    ("children", "master_id", "INTEGER DEFAULT 0"),
];

const INSERT_NODE: &str = "INSERT OR REPLACE INTO node (node_id, name, txt, syntax, tags, is_ro, is_richtxt, \
     has_codebox, has_table, has_image, level, ts_creation, ts_lastsave) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)";
const UPDATE_NODE_PROPS: &str = "UPDATE node SET name=?2, syntax=?3, tags=?4, is_ro=?5, is_richtxt=?6, level=?7, \
     ts_creation=?8, ts_lastsave=?9 WHERE node_id=?1";
const UPDATE_NODE_BUFF: &str =
    "UPDATE node SET txt=?2, syntax=?3, has_codebox=?4, has_table=?5, has_image=?6, ts_lastsave=?7 WHERE node_id=?1";
const UPSERT_CHILDREN: &str =
    "INSERT OR REPLACE INTO children (node_id, father_id, sequence, master_id) VALUES (?1, ?2, ?3, ?4)";

bitflags! {
    /// Low bits of `node.is_richtxt`; the foreground colour sits above them.
    struct RichTxtFlags: i64 {
        const RICH_TEXT = 0b001;
        const BOLD = 0b010;
        const HAS_FOREGROUND = 0b100;
    }
}

bitflags! {
    /// `node.level`.
    struct SearchFlags: i64 {
        const EXCLUDE_ME = 0b01;
        const EXCLUDE_CHILDREN = 0b10;
    }
}

const FOREGROUND_SHIFT: u32 = 3;

fn pack_is_ro(props: &NodeProps) -> i64 {
    (i64::from(props.custom_icon_id) << 1) | i64::from(props.is_ro)
}

fn pack_is_richtxt(props: &NodeProps) -> i64 {
    let mut flags = RichTxtFlags::empty();
    flags.set(RichTxtFlags::RICH_TEXT, props.is_rich_text());
    flags.set(RichTxtFlags::BOLD, props.is_bold);
    let rgb = props.foreground_rgb24();
    flags.set(RichTxtFlags::HAS_FOREGROUND, rgb.is_some());
    flags.bits() | (i64::from(rgb.unwrap_or(0)) << FOREGROUND_SHIFT)
}

fn pack_level(props: &NodeProps) -> i64 {
    let mut flags = SearchFlags::empty();
    flags.set(SearchFlags::EXCLUDE_ME, props.exclude_from_search);
    flags.set(SearchFlags::EXCLUDE_CHILDREN, props.exclude_children_from_search);
    flags.bits()
}

/// Applies the packed columns to `props`.
fn unpack_into(props: &mut NodeProps, is_ro: i64, is_richtxt: i64, level: i64) {
    props.is_ro = is_ro & 1 == 1;
    props.custom_icon_id = u32::try_from(is_ro >> 1).unwrap_or(0);
    let rich = RichTxtFlags::from_bits_truncate(is_richtxt);
    props.is_bold = rich.contains(RichTxtFlags::BOLD);
    props.foreground = None;
    if rich.contains(RichTxtFlags::HAS_FOREGROUND) {
        props.set_foreground_rgb24(((is_richtxt >> FOREGROUND_SHIFT) & 0xff_ffff) as u32);
    }
    let search = SearchFlags::from_bits_truncate(level);
    props.exclude_from_search = search.contains(SearchFlags::EXCLUDE_ME);
    props.exclude_children_from_search = search.contains(SearchFlags::EXCLUDE_CHILDREN);
}

fn open_pool(path: &Path) -> Result<Pool<SqliteConnectionManager>> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.busy_timeout(Duration::from_millis(500))?;
        Ok(())
    });
    let pool = Pool::builder()
        .max_size(1)
        .connection_timeout(Duration::from_secs(5))
        .build(manager)
        .with_context(|| format!("opening {}", path.display()))?;
    Ok(pool)
}

/// Adds the columns older documents lack.
fn fix_db_tables(conn: &Connection) -> Result<()> {
    let mut present: HashMap<&str, HashSet<String>> = HashMap::new();
    for &(table, column, decl) in LATE_COLUMNS {
        if !present.contains_key(table) {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
            let cols = stmt.query_map([], |row| row.get::<_, String>(1))?.collect::<Result<HashSet<_>, _>>()?;
            present.insert(table, cols);
        }
        if !present[table].contains(column) {
            log::info!("adding missing column {table}.{column}");
            conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))?;
        }
    }
    Ok(())
}

fn quick_check(conn: &Connection, path: &Path) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA quick_check")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?.collect::<Result<Vec<_>, _>>()?;
    if rows.len() == 1 && rows[0] == "ok" {
        return Ok(());
    }
    Err(StorageError::IntegrityCheck { path: path.to_path_buf(), reason: rows.join("; ") }.into())
}

fn write_widgets(conn: &Connection, id: NodeId, content: &NodeContent) -> Result<()> {
    for table in ["codebox", "grid", "image"] {
        conn.execute(&format!("DELETE FROM {table} WHERE node_id=?1"), params![id.0])?;
    }
    let mut codebox = conn.prepare_cached(
        "INSERT INTO codebox (node_id, offset, justification, txt, syntax, width, height, is_width_pix, \
         do_highl_bra, do_show_linenum) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )?;
    let mut grid = conn.prepare_cached(
        "INSERT INTO grid (node_id, offset, justification, txt, col_min, col_max) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    let mut image = conn.prepare_cached(
        "INSERT INTO image (node_id, offset, justification, anchor, png, filename, link, time) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for w in &content.widgets {
        let offset = w.offset as i64;
        let just = w.justification.as_str();
        match &w.kind {
            WidgetKind::CodeBox(cb) => {
                codebox.execute(params![
                    id.0,
                    offset,
                    just,
                    cb.text,
                    cb.syntax,
                    cb.width,
                    cb.height,
                    cb.width_in_pixels,
                    cb.highlight_brackets,
                    cb.show_line_numbers
                ])?;
            }
            WidgetKind::Table(t) => {
                grid.execute(params![id.0, offset, just, xml_codec::table_to_xml(t)?, t.col_min, t.col_max])?;
            }
            WidgetKind::Anchor { name } => {
                image.execute(params![id.0, offset, just, name, Vec::<u8>::new(), "", "", 0i64])?;
            }
            WidgetKind::Image { png, link } => {
                image.execute(params![id.0, offset, just, "", png, "", link, 0i64])?;
            }
            WidgetKind::Latex { source } => {
                image.execute(params![id.0, offset, just, "", source.as_bytes(), LATEX_FILENAME, "", 0i64])?;
            }
            WidgetKind::EmbeddedFile { name, data, time } => {
                image.execute(params![id.0, offset, just, "", data, name, "", time])?;
            }
        }
    }
    Ok(())
}

fn text_column(content: &NodeContent) -> Result<String> {
    match &content.text {
        TextContent::Rich(segments) => xml_codec::rich_to_xml(segments),
        TextContent::Plain(text) => Ok(text.clone()),
    }
}

/// The full-node statement: every column of `node` plus all widget rows.
fn insert_node(conn: &Connection, id: NodeId, props: &NodeProps, content: &NodeContent) -> Result<()> {
    conn.prepare_cached(INSERT_NODE)?.execute(params![
        id.0,
        props.name,
        text_column(content)?,
        props.syntax,
        props.tags,
        pack_is_ro(props),
        pack_is_richtxt(props),
        content.has_codebox(),
        content.has_table(),
        content.has_image(),
        pack_level(props),
        props.ts_creation,
        props.ts_lastsave
    ])?;
    write_widgets(conn, id, content)
}

fn update_props(conn: &Connection, id: NodeId, props: &NodeProps) -> Result<()> {
    conn.prepare_cached(UPDATE_NODE_PROPS)?.execute(params![
        id.0,
        props.name,
        props.syntax,
        props.tags,
        pack_is_ro(props),
        pack_is_richtxt(props),
        pack_level(props),
        props.ts_creation,
        props.ts_lastsave
    ])?;
    Ok(())
}

fn update_buff(conn: &Connection, id: NodeId, props: &NodeProps, content: &NodeContent) -> Result<()> {
    conn.prepare_cached(UPDATE_NODE_BUFF)?.execute(params![
        id.0,
        text_column(content)?,
        props.syntax,
        content.has_codebox(),
        content.has_table(),
        content.has_image(),
        props.ts_lastsave
    ])?;
    write_widgets(conn, id, content)
}

fn write_hier(conn: &Connection, id: NodeId, parent: NodeId, sequence: usize, master: Option<NodeId>) -> Result<()> {
    conn.prepare_cached(UPSERT_CHILDREN)?
        .execute(params![id.0, parent.0, sequence as i64, master.map(|m| m.0).unwrap_or(0)])?;
    Ok(())
}

fn write_bookmarks(conn: &Connection, bookmarks: &[NodeId]) -> Result<()> {
    conn.execute("DELETE FROM bookmark", [])?;
    let mut stmt = conn.prepare_cached("INSERT INTO bookmark (node_id, sequence) VALUES (?1, ?2)")?;
    for (i, id) in bookmarks.iter().enumerate() {
        stmt.execute(params![id.0, i as i64 + 1])?;
    }
    Ok(())
}

fn delete_rows(conn: &Connection, id: NodeId) -> Result<()> {
    for table in ["node", "codebox", "grid", "image", "children", "bookmark"] {
        conn.execute(&format!("DELETE FROM {table} WHERE node_id=?1"), params![id.0])?;
    }
    Ok(())
}

/// Deletes `root` and its persisted descendants, skipping nodes the document still holds
/// (they were moved out before being saved).
fn remove_cascade(conn: &Connection, root: NodeId, doc: &Document) -> Result<usize> {
    let mut queue = VecDeque::from([root]);
    let mut removed = 0;
    let mut kids = conn.prepare_cached("SELECT node_id FROM children WHERE father_id=?1")?;
    while let Some(id) = queue.pop_front() {
        let children = kids.query_map(params![id.0], |row| row.get::<_, i64>(0))?.collect::<Result<Vec<_>, _>>()?;
        for child in children {
            if !doc.contains(NodeId(child)) {
                queue.push_back(NodeId(child));
            }
        }
        delete_rows(conn, id)?;
        removed += 1;
    }
    Ok(removed)
}

fn read_content(conn: &Connection, id: NodeId, syntax: &str) -> Result<NodeContent> {
    let txt: Option<String> = conn
        .query_row("SELECT txt FROM node WHERE node_id=?1", params![id.0], |row| row.get(0))
        .optional()?
        .ok_or(StorageError::NodeNotFound(id))?;
    let txt = txt.unwrap_or_default();
    let text = if syntax == crate::document::node::SYNTAX_RICH_TEXT {
        let segments = if txt.is_empty() { Vec::new() } else { xml_codec::rich_from_xml(&txt)? };
        TextContent::Rich(segments)
    } else {
        TextContent::Plain(txt)
    };

    let mut widgets = Vec::new();
    let mut stmt = conn.prepare_cached(
        "SELECT offset, justification, txt, syntax, width, height, is_width_pix, do_highl_bra, do_show_linenum \
         FROM codebox WHERE node_id=?1",
    )?;
    let rows = stmt.query_map(params![id.0], |row| {
        Ok(AnchoredWidget {
            offset: row.get::<_, i64>(0)?.max(0) as usize,
            justification: Justification::parse(&row.get::<_, Option<String>>(1)?.unwrap_or_default()),
            kind: WidgetKind::CodeBox(CodeBox {
                text: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                syntax: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                width: row.get(4)?,
                height: row.get(5)?,
                width_in_pixels: row.get(6)?,
                highlight_brackets: row.get(7)?,
                show_line_numbers: row.get(8)?,
            }),
        })
    })?;
    for w in rows {
        widgets.push(w?);
    }

    let mut stmt =
        conn.prepare_cached("SELECT offset, justification, txt, col_min, col_max FROM grid WHERE node_id=?1")?;
    let rows = stmt.query_map(params![id.0], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            row.get::<_, i64>(3)?,
            row.get::<_, i64>(4)?,
        ))
    })?;
    for row in rows {
        let (offset, just, txt, col_min, col_max) = row?;
        let table: Table = xml_codec::table_from_xml(&txt, col_min, col_max)
            .with_context(|| format!("table of node {id}"))?;
        widgets.push(AnchoredWidget {
            offset: offset.max(0) as usize,
            justification: Justification::parse(&just),
            kind: WidgetKind::Table(table),
        });
    }

    let mut stmt = conn.prepare_cached(
        "SELECT offset, justification, anchor, png, filename, link, time FROM image WHERE node_id=?1",
    )?;
    let rows = stmt.query_map(params![id.0], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            row.get::<_, Option<Vec<u8>>>(3)?.unwrap_or_default(),
            row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            row.get::<_, Option<i64>>(6)?.unwrap_or_default(),
        ))
    })?;
    for row in rows {
        let (offset, just, anchor, png, filename, link, time) = row?;
        let kind = if !anchor.is_empty() {
            WidgetKind::Anchor { name: anchor }
        } else if filename == LATEX_FILENAME {
            WidgetKind::Latex { source: String::from_utf8(png).context("latex source is not utf-8")? }
        } else if !filename.is_empty() {
            WidgetKind::EmbeddedFile { name: filename, data: png, time }
        } else {
            WidgetKind::Image { png, link }
        };
        widgets.push(AnchoredWidget { offset: offset.max(0) as usize, justification: Justification::parse(&just), kind });
    }
    widgets.sort_by_key(|w| w.offset);
    Ok(NodeContent { text, widgets })
}

/// Single-file SQLite document (`.ctb`).
///
/// Content is read lazily per node. The first save of an entity writes the whole
/// document into a fresh file; later saves only touch what the ledger marks dirty,
/// inside one transaction.
#[derive(Default)]
pub struct SqliteEntity {
    pool: Option<Pool<SqliteConnectionManager>>,
    path: Option<PathBuf>,
    /// Ids reassigned on load, mapped back to the row id on disk.
    renamed: HashMap<NodeId, NodeId>,
}

impl SqliteEntity {
    pub fn new() -> Self {
        Self::default()
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        let pool = self.pool.as_ref().ok_or(StorageError::NotOpened)?;
        Ok(pool.get()?)
    }

    fn is_bound_to(&self, path: &Path) -> bool {
        self.pool.is_some() && self.path.as_deref() == Some(path)
    }

    fn read_tree(conn: &Connection, builder: &mut DocumentBuilder, report: &mut PopulateReport) -> Result<()> {
        let mut props: HashMap<i64, NodeProps> = HashMap::new();
        let mut stmt = conn.prepare(
            "SELECT node_id, name, syntax, tags, is_ro, is_richtxt, level, ts_creation, ts_lastsave FROM node",
        )?;
        let rows = stmt.query_map([], |row| {
            let mut p = NodeProps {
                name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                syntax: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                tags: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                ts_creation: row.get::<_, Option<i64>>(7)?.unwrap_or_default(),
                ts_lastsave: row.get::<_, Option<i64>>(8)?.unwrap_or_default(),
                ..NodeProps::default()
            };
            unpack_into(
                &mut p,
                row.get::<_, Option<i64>>(4)?.unwrap_or_default(),
                row.get::<_, Option<i64>>(5)?.unwrap_or_default(),
                row.get::<_, Option<i64>>(6)?.unwrap_or_default(),
            );
            Ok((row.get::<_, i64>(0)?, p))
        })?;
        for row in rows {
            let (id, p) = row?;
            props.insert(id, p);
        }

        let mut stmt = conn.prepare("SELECT node_id, father_id, sequence, master_id FROM children")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<i64>>(1)?.unwrap_or_default(),
                row.get::<_, Option<i64>>(2)?.unwrap_or_default(),
                row.get::<_, Option<i64>>(3)?.unwrap_or_default(),
            ))
        })?;
        let mut placed = HashSet::new();
        for row in rows {
            let (id, father, sequence, master) = row?;
            let master = (master > 0).then_some(NodeId(master));
            let node_props = match (master, props.get(&id)) {
                (_, Some(p)) => p.clone(),
                (Some(_), None) => NodeProps::default(),
                (None, None) => {
                    report.warnings.push(format!("node {id} has no properties row"));
                    NodeProps { name: format!("?{id}"), ..NodeProps::default() }
                }
            };
            placed.insert(id);
            builder.push_flat(
                NodeId(father),
                LoadedNode { id: NodeId(id), sequence, master, props: node_props, content: None },
            );
        }
        let mut stray: Vec<(i64, NodeProps)> = props.into_iter().filter(|(id, _)| !placed.contains(id)).collect();
        stray.sort_by_key(|(id, _)| *id);
        for (id, p) in stray {
            report.warnings.push(format!("node {id} has no hierarchy row, moved to top level"));
            builder.push_flat(NodeId::ROOT, LoadedNode { id: NodeId(id), sequence: i64::MAX, master: None, props: p, content: None });
        }

        let mut stmt = conn.prepare("SELECT node_id FROM bookmark ORDER BY sequence")?;
        let bookmarks = stmt.query_map([], |row| row.get::<_, i64>(0))?.collect::<Result<Vec<_>, _>>()?;
        builder.set_bookmarks(bookmarks.into_iter().map(NodeId).collect());
        Ok(())
    }

    /// Writes every planned node into an empty database.
    fn write_full(&self, conn: &mut Connection, req: &SaveRequest<'_>) -> Result<()> {
        let plan = req.plan()?;
        let tx = conn.transaction()?;
        tx.execute_batch(SCHEMA)?;
        for node in &plan.nodes {
            if node.master.is_none() {
                let props = req.document.props(node.source).ok_or(StorageError::NodeNotFound(node.source))?;
                let content = req
                    .document
                    .content(node.source)
                    .ok_or_else(|| anyhow!("content of node {} is not loaded", node.source))?;
                match node.range {
                    Some((start, end)) => insert_node(&tx, node.id, props, &content.slice(start, end))?,
                    None => insert_node(&tx, node.id, props, content)?,
                }
            }
            write_hier(&tx, node.id, node.parent, node.sequence, node.master)?;
        }
        write_bookmarks(&tx, &plan.bookmarks)?;
        tx.commit()?;
        log::debug!("wrote {} nodes", plan.nodes.len());
        Ok(())
    }

    fn write_incremental(&self, conn: &mut Connection, req: &SaveRequest<'_>) -> Result<()> {
        let doc = req.document;
        let pending = req.sync_pending;
        let tx = conn.transaction()?;

        let mut removed = 0;
        let mut to_rm: Vec<NodeId> = pending.nodes_to_rm.iter().copied().collect();
        to_rm.sort();
        for id in to_rm {
            removed += remove_cascade(&tx, self.db_id(id), doc)?;
        }

        let mut dirty: Vec<(NodeId, NodeState)> = pending
            .nodes_to_write
            .iter()
            .filter(|(id, _)| doc.contains(**id))
            .map(|(id, st)| (*id, *st))
            .collect();
        dirty.sort_by_key(|(id, _)| (doc.depth(*id), *id));

        for (id, state) in &dirty {
            let node = doc.node(*id).ok_or(StorageError::NodeNotFound(*id))?;
            let master = node.alias_master();
            // new rows keep their in-memory id, existing ones may live under a reassigned one
            let db_id = if state.is_new() { *id } else { self.db_id(*id) };
            if master.is_none() {
                let props = doc.props(*id).ok_or(StorageError::NodeNotFound(*id))?;
                if state.is_new() {
                    let content = doc.content(*id).ok_or_else(|| anyhow!("content of node {id} is not loaded"))?;
                    insert_node(&tx, db_id, props, content)?;
                } else {
                    if state.prop {
                        update_props(&tx, db_id, props)?;
                    }
                    if state.buff {
                        let content =
                            doc.content(*id).ok_or_else(|| anyhow!("content of node {id} is not loaded"))?;
                        update_buff(&tx, db_id, props, content)?;
                    }
                }
            }
            if state.is_new() || state.hier {
                let parent = doc.parent_of(*id).unwrap_or(NodeId::ROOT);
                let sequence = doc.sequence_of(*id).unwrap_or(1);
                write_hier(&tx, db_id, self.row_id(pending, parent), sequence, master.map(|m| self.row_id(pending, m)))?;
            }
        }

        if pending.bookmarks_to_write {
            let bookmarks: Vec<NodeId> = doc.bookmarks().iter().map(|b| self.db_id(*b)).collect();
            write_bookmarks(&tx, &bookmarks)?;
        }
        tx.commit()?;
        log::debug!("incremental save: {} nodes written, {} rows removed", dirty.len(), removed);
        Ok(())
    }

    /// Row id on disk for a node whose id was reassigned on load.
    fn db_id(&self, id: NodeId) -> NodeId {
        self.renamed.get(&id).copied().unwrap_or(id)
    }

    /// Like [`Self::db_id`], but nodes about to be inserted use their own id.
    fn row_id(&self, pending: &SyncPending, id: NodeId) -> NodeId {
        match pending.state(id) {
            Some(state) if state.is_new() => id,
            _ => self.db_id(id),
        }
    }
}

impl StorageEntity for SqliteEntity {
    fn doc_type(&self) -> DocType {
        DocType::Sqlite
    }

    fn populate_treestore(&mut self, path: &Path, doc: &mut Document, mode: LoadMode) -> Result<PopulateReport> {
        if !path.is_file() {
            return Err(StorageError::FileMissing(path.to_path_buf()).into());
        }
        let pool = open_pool(path)?;
        let conn = pool.get()?;
        quick_check(&conn, path)?;
        fix_db_tables(&conn)?;

        let mut report = PopulateReport::default();
        let mut builder = DocumentBuilder::new();
        Self::read_tree(&conn, &mut builder, &mut report).with_context(|| format!("reading {}", path.display()))?;
        let (built, build) = builder.build();
        report.warnings.extend(build.warnings);
        report.reassigned_ids = build.reassigned;
        // a reassigned node keeps reading the row it was stored under
        let renamed: HashMap<NodeId, NodeId> = report.reassigned_ids.iter().map(|(old, new)| (*new, *old)).collect();

        if mode == LoadMode::DryRun {
            for id in built.traverse() {
                if built.is_alias(id) {
                    continue;
                }
                let syntax = built.props(id).map(|p| p.syntax.clone()).unwrap_or_default();
                let db_id = renamed.get(&id).copied().unwrap_or(id);
                read_content(&conn, db_id, &syntax).with_context(|| format!("node {id} of {}", path.display()))?;
            }
            log::debug!("dry run of {} ok, {} nodes", path.display(), built.len());
            return Ok(report);
        }

        drop(conn);
        self.renamed = renamed;
        self.pool = Some(pool);
        self.path = Some(path.to_path_buf());
        *doc = built;
        log::info!("loaded {} nodes from {}", doc.len(), path.display());
        Ok(report)
    }

    fn save_treestore(&mut self, req: &SaveRequest<'_>) -> Result<()> {
        if !req.export.is_export() && self.is_bound_to(req.path) {
            let mut conn = self.conn()?;
            return self.write_incremental(&mut conn, req);
        }

        if req.path.exists() {
            fs::remove_file(req.path).with_context(|| format!("replacing {}", req.path.display()))?;
        }
        let pool = open_pool(req.path)?;
        {
            let mut conn = pool.get()?;
            self.write_full(&mut conn, req).with_context(|| format!("writing {}", req.path.display()))?;
        }
        if !req.export.is_export() {
            self.pool = Some(pool);
            self.path = Some(req.path.to_path_buf());
            self.renamed.clear();
        }
        Ok(())
    }

    fn get_delayed_text_buffer(&mut self, id: NodeId, syntax: &str) -> Result<NodeContent> {
        let conn = self.conn()?;
        read_content(&conn, self.db_id(id), syntax)
    }

    fn import_nodes(&mut self, path: &Path, doc: &mut Document, parent: NodeId) -> Result<Vec<NodeId>> {
        import_with(Box::new(SqliteEntity::new()), path, doc, parent)
    }

    fn close_connect(&mut self) {
        if self.pool.take().is_some() {
            log::debug!("closed connection to {:?}", self.path);
        }
    }

    fn reopen_connect(&mut self) -> Result<()> {
        let path = self.path.clone().ok_or(StorageError::NotOpened)?;
        self.pool = Some(open_pool(&path)?);
        Ok(())
    }

    fn test_connection(&mut self) -> Result<()> {
        let Some(path) = self.path.clone() else { return Ok(()) };
        check_writable(&path)?;
        let probe = |entity: &Self| -> Result<()> {
            let conn = entity.conn()?;
            conn.query_row("SELECT COUNT(*) FROM node", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        };
        if probe(self).is_ok() {
            return Ok(());
        }
        log::warn!("connection to {} lost, reconnecting", path.display());
        self.close_connect();
        self.reopen_connect()?;
        probe(self).with_context(|| format!("reconnecting to {}", path.display()))
    }

    fn vacuum(&mut self) -> Result<()> {
        self.conn()?.execute_batch("VACUUM")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ExportScope, RichSegment};
    use crate::sync::SyncPending;

    fn rich_doc() -> (Document, NodeId, NodeId) {
        let mut doc = Document::new();
        let mut props = NodeProps::new("A");
        props.is_bold = true;
        props.custom_icon_id = 5;
        props.foreground = Some("#00ff80".into());
        props.exclude_children_from_search = true;
        let content = NodeContent {
            text: TextContent::Rich(vec![
                RichSegment::plain("hello "),
                RichSegment::plain("world").with_attr("weight", "heavy"),
            ]),
            widgets: Vec::new(),
        }
        .with_widget(AnchoredWidget::new(2, WidgetKind::Image { png: vec![1, 2, 3], link: String::new() }))
        .with_widget(AnchoredWidget::new(3, WidgetKind::Latex { source: "x^2".into() }))
        .with_widget(AnchoredWidget::new(4, WidgetKind::Anchor { name: "top".into() }))
        .with_widget(AnchoredWidget::new(
            5,
            WidgetKind::Table(Table { col_min: 10, col_max: 100, rows: vec![vec!["a".into()], vec!["h".into()]] }),
        ));
        let a = doc.add_node(NodeId::ROOT, None, props, Some(content)).unwrap();
        let b = doc
            .add_node(a, None, NodeProps::new("B").with_syntax("python"), Some(NodeContent::plain("print(1)\n")))
            .unwrap();
        doc.set_bookmarks(vec![b]);
        (doc, a, b)
    }

    fn full_save(entity: &mut SqliteEntity, path: &Path, doc: &Document) {
        let sp = SyncPending::new();
        entity.save_treestore(&SaveRequest::new(path, doc, &sp)).unwrap();
    }

    fn reload(path: &Path) -> (SqliteEntity, Document) {
        let mut entity = SqliteEntity::new();
        let mut doc = Document::new();
        entity.populate_treestore(path, &mut doc, LoadMode::Normal).unwrap();
        (entity, doc)
    }

    fn raw(path: &Path, sql: &str) -> String {
        let conn = Connection::open(path).unwrap();
        conn.query_row(sql, [], |row| row.get::<_, String>(0)).unwrap()
    }

    #[test]
    fn bitfields_pack_and_unpack() {
        let mut p = NodeProps::new("x");
        p.is_ro = true;
        p.custom_icon_id = 9;
        p.is_bold = true;
        p.foreground = Some("#123456".into());
        p.exclude_from_search = true;
        assert_eq!(pack_is_ro(&p), 19);
        assert_eq!(pack_is_richtxt(&p), 0b111 | (0x123456 << 3));
        assert_eq!(pack_level(&p), 1);

        let mut q = NodeProps::new("x");
        unpack_into(&mut q, pack_is_ro(&p), pack_is_richtxt(&p), pack_level(&p));
        assert_eq!((q.is_ro, q.custom_icon_id, q.is_bold), (true, 9, true));
        assert_eq!(q.foreground.as_deref(), Some("#123456"));
        assert!(q.exclude_from_search && !q.exclude_children_from_search);
    }

    #[test]
    fn round_trip_with_widgets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.ctb");
        let (doc, a, b) = rich_doc();
        full_save(&mut SqliteEntity::new(), &path, &doc);

        let (mut entity, loaded) = reload(&path);
        assert_eq!(loaded.traverse(), vec![a, b]);
        assert_eq!(loaded.props(a), doc.props(a));
        assert_eq!(loaded.props(b), doc.props(b));
        assert_eq!(loaded.bookmarks(), &[b]);
        assert!(!loaded.is_content_loaded(a));
        assert_eq!(&entity.get_delayed_text_buffer(a, "custom-colors").unwrap(), doc.content(a).unwrap());
        assert_eq!(&entity.get_delayed_text_buffer(b, "python").unwrap(), doc.content(b).unwrap());
        // repeat fetch re-queries
        assert!(entity.get_delayed_text_buffer(b, "python").is_ok());
    }

    #[test]
    fn prop_only_save_leaves_text_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.ctb");
        let (doc, a, _b) = rich_doc();
        full_save(&mut SqliteEntity::new(), &path, &doc);
        let txt_before = raw(&path, "SELECT txt FROM node WHERE node_id=1");

        let (mut entity, mut loaded) = reload(&path);
        loaded.props_mut(a).unwrap().name = "renamed".into();
        let mut sp = SyncPending::new();
        sp.pending_edit_prop(a);
        entity.save_treestore(&SaveRequest::new(&path, &loaded, &sp)).unwrap();

        assert_eq!(raw(&path, "SELECT name FROM node WHERE node_id=1"), "renamed");
        assert_eq!(raw(&path, "SELECT txt FROM node WHERE node_id=1"), txt_before);
        assert!(!loaded.is_content_loaded(a));
    }

    #[test]
    fn removal_cascades_and_keeps_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.ctb");
        let mut doc = Document::new();
        let ids: Vec<NodeId> = (0..3)
            .map(|i| doc.add_node(NodeId::ROOT, None, NodeProps::new(format!("n{i}")), Some(NodeContent::rich("x"))).unwrap())
            .collect();
        let child = doc.add_node(ids[1], None, NodeProps::new("child"), Some(NodeContent::rich("c"))).unwrap();
        full_save(&mut SqliteEntity::new(), &path, &doc);

        let (mut entity, mut loaded) = reload(&path);
        loaded.remove_subtree(ids[1]).unwrap();
        let mut sp = SyncPending::new();
        sp.pending_rm(ids[1]);
        sp.pending_edit_hier(ids[2]);
        entity.save_treestore(&SaveRequest::new(&path, &loaded, &sp)).unwrap();
        entity.close_connect();

        let (_e, again) = reload(&path);
        assert!(!again.contains(ids[1]));
        assert!(!again.contains(child));
        assert_eq!(again.children(NodeId::ROOT), &[ids[0], ids[2]]);
        assert_eq!(again.sequence_of(ids[2]), Some(2));
        assert_eq!(raw(&path, "SELECT group_concat(sequence) FROM (SELECT sequence FROM children ORDER BY sequence)"), "1,2");
    }

    #[test]
    fn new_nodes_and_aliases_incrementally() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.ctb");
        let (doc, a, _b) = rich_doc();
        let mut entity = SqliteEntity::new();
        full_save(&mut entity, &path, &doc);

        let mut doc = doc;
        let alias = doc.add_shared_alias(a, NodeId::ROOT, None).unwrap();
        let mut sp = SyncPending::new();
        sp.pending_new(alias);
        entity.save_treestore(&SaveRequest::new(&path, &doc, &sp)).unwrap();

        let (_e, loaded) = reload(&path);
        assert_eq!(loaded.resolve(alias), Some(a));
        assert_eq!(raw(&path, "SELECT count(*) || '' FROM node"), "2");
    }

    #[test]
    fn migration_adds_missing_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.ctb");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE node (node_id INTEGER UNIQUE, name TEXT, txt TEXT, syntax TEXT, tags TEXT, is_ro INTEGER,
                     is_richtxt INTEGER, has_codebox INTEGER, has_table INTEGER, has_image INTEGER, level INTEGER);
                 CREATE TABLE codebox (node_id INTEGER, offset INTEGER, justification TEXT, txt TEXT, syntax TEXT,
                     width INTEGER, height INTEGER, is_width_pix INTEGER, do_highl_bra INTEGER, do_show_linenum INTEGER);
                 CREATE TABLE grid (node_id INTEGER, offset INTEGER, justification TEXT, txt TEXT, col_min INTEGER, col_max INTEGER);
                 CREATE TABLE image (node_id INTEGER, offset INTEGER, justification TEXT, anchor TEXT, png BLOB);
                 CREATE TABLE children (node_id INTEGER UNIQUE, father_id INTEGER, sequence INTEGER);
                 CREATE TABLE bookmark (node_id INTEGER UNIQUE, sequence INTEGER);
                 INSERT INTO node VALUES (1, 'old', 'plain', 'plain-text', '', 0, 0, 0, 0, 0, 0);
                 INSERT INTO children VALUES (1, 0, 1);",
            )
            .unwrap();
        }
        let (mut entity, doc) = reload(&path);
        assert_eq!(doc.props(NodeId(1)).unwrap().name, "old");
        assert_eq!(entity.get_delayed_text_buffer(NodeId(1), "plain-text").unwrap(), NodeContent::plain("plain"));
        assert_eq!(raw(&path, "SELECT count(*) || '' FROM pragma_table_info('children') WHERE name='master_id'"), "1");
    }

    #[test]
    fn text_selection_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sel.ctb");
        let (doc, a, _b) = rich_doc();
        let sp = SyncPending::new();
        let req = SaveRequest::new(&path, &doc, &sp)
            .with_export(ExportScope::TextSelection { node: a, start: 6, end: 11 }, Default::default());
        let mut entity = SqliteEntity::new();
        entity.save_treestore(&req).unwrap();
        assert!(entity.pool.is_none());

        let (mut e, loaded) = reload(&path);
        assert_eq!(loaded.len(), 1);
        let content = e.get_delayed_text_buffer(a, "custom-colors").unwrap();
        assert_eq!(content.text.plain_text(), "world");
        assert!(content.widgets.is_empty());
    }

    #[test]
    fn missing_file_and_dry_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.ctb");
        let mut entity = SqliteEntity::new();
        let err = entity.populate_treestore(&path, &mut Document::new(), LoadMode::Normal).unwrap_err();
        assert!(matches!(StorageError::from(err), StorageError::FileMissing(_)));

        let (doc, ..) = rich_doc();
        full_save(&mut SqliteEntity::new(), &path, &doc);
        let mut scratch = Document::new();
        entity.populate_treestore(&path, &mut scratch, LoadMode::DryRun).unwrap();
        assert!(scratch.is_empty());
        assert!(entity.pool.is_none());
    }

    #[test]
    fn test_connection_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.ctb");
        let (doc, ..) = rich_doc();
        let mut entity = SqliteEntity::new();
        full_save(&mut entity, &path, &doc);
        entity.test_connection().unwrap();

        entity.close_connect();
        fs::remove_file(&path).unwrap();
        let err = entity.test_connection().unwrap_err();
        assert!(matches!(StorageError::from(err), StorageError::FileMissing(_)));
    }
}
