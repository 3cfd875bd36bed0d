use std::collections::{BTreeMap, HashMap};
use std::io::Write;

use anyhow::{anyhow, bail, Context, Result};
use base64::Engine as _;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use super::cache::{StorageCache, WidgetKey};
use crate::document::content::{CodeBox, Table};
use crate::document::{AnchoredWidget, Justification, NodeContent, NodeId, NodeProps, RichSegment, TextContent, WidgetKind};

/// File name that marks a latex widget among `encoded_png` elements.
pub(crate) const LATEX_FILENAME: &str = "__ct_special.tex";

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// How blob payloads appear in `<encoded_png>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlobMode {
    /// Base64 element text.
    Inline,
    /// A `sha256` attribute naming a blob file stored next to the XML.
    Sha256,
}

/// Blob handling for one node's content while writing.
pub(crate) struct BlobWrite<'a> {
    pub mode: BlobMode,
    pub cache: Option<&'a StorageCache>,
    /// Cache owner; `None` when the widget list was sliced and indices moved.
    pub owner: Option<NodeId>,
}

pub(crate) fn new_writer() -> Writer<Vec<u8>> {
    Writer::new(Vec::new())
}

pub(crate) fn write_decl<W: Write>(w: &mut Writer<W>) -> Result<()> {
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    Ok(())
}

fn flag(b: bool) -> &'static str {
    if b {
        "True"
    } else {
        "False"
    }
}

fn parse_flag(s: Option<&String>) -> bool {
    matches!(s.map(String::as_str), Some("True" | "true" | "1"))
}

fn parse_num<T: std::str::FromStr + Default>(s: Option<&String>) -> T {
    s.and_then(|v| v.trim().parse().ok()).unwrap_or_default()
}

/// Opens a `<node>` element. Aliases carry only their name and `master_id`.
pub(crate) fn write_node_start<W: Write>(
    w: &mut Writer<W>,
    id: NodeId,
    master: Option<NodeId>,
    props: &NodeProps,
) -> Result<()> {
    let mut el = BytesStart::new("node");
    let id_str = id.0.to_string();
    el.push_attribute(("name", props.name.as_str()));
    el.push_attribute(("unique_id", id_str.as_str()));
    if let Some(master) = master {
        let master_str = master.0.to_string();
        el.push_attribute(("master_id", master_str.as_str()));
        w.write_event(Event::Start(el))?;
        return Ok(());
    }
    let icon = props.custom_icon_id.to_string();
    let ts_creation = props.ts_creation.to_string();
    let ts_lastsave = props.ts_lastsave.to_string();
    el.push_attribute(("prog_lang", props.syntax.as_str()));
    el.push_attribute(("tags", props.tags.as_str()));
    el.push_attribute(("readonly", flag(props.is_ro)));
    el.push_attribute(("nosearch_me", flag(props.exclude_from_search)));
    el.push_attribute(("nosearch_ch", flag(props.exclude_children_from_search)));
    el.push_attribute(("custom_icon_id", icon.as_str()));
    el.push_attribute(("is_bold", flag(props.is_bold)));
    if let Some(fg) = &props.foreground {
        el.push_attribute(("foreground", fg.as_str()));
    }
    el.push_attribute(("ts_creation", ts_creation.as_str()));
    el.push_attribute(("ts_lastsave", ts_lastsave.as_str()));
    w.write_event(Event::Start(el))?;
    Ok(())
}

pub(crate) fn write_node_end<W: Write>(w: &mut Writer<W>) -> Result<()> {
    w.write_event(Event::End(BytesEnd::new("node")))?;
    Ok(())
}

fn write_text_el<W: Write>(w: &mut Writer<W>, el: BytesStart<'_>, text: &str) -> Result<()> {
    let name = String::from_utf8_lossy(el.name().as_ref()).into_owned();
    if text.is_empty() {
        w.write_event(Event::Empty(el))?;
    } else {
        w.write_event(Event::Start(el))?;
        w.write_event(Event::Text(BytesText::new(text)))?;
        w.write_event(Event::End(BytesEnd::new(name)))?;
    }
    Ok(())
}

/// Writes the text runs and widgets of a node.
pub(crate) fn write_content<W: Write>(w: &mut Writer<W>, content: &NodeContent, blobs: &BlobWrite<'_>) -> Result<()> {
    match &content.text {
        TextContent::Rich(segments) => {
            for seg in segments {
                let mut el = BytesStart::new("rich_text");
                for (k, v) in &seg.attrs {
                    el.push_attribute((k.as_str(), v.as_str()));
                }
                write_text_el(w, el, &seg.text)?;
            }
        }
        TextContent::Plain(text) => write_text_el(w, BytesStart::new("rich_text"), text)?,
    }

    for (index, widget) in content.widgets.iter().enumerate() {
        let offset = widget.offset.to_string();
        let base = |tag: &'static str| {
            let mut el = BytesStart::new(tag);
            el.push_attribute(("char_offset", offset.as_str()));
            el.push_attribute(("justification", widget.justification.as_str()));
            el
        };
        match &widget.kind {
            WidgetKind::CodeBox(cb) => {
                let mut el = base("codebox");
                let (width, height) = (cb.width.to_string(), cb.height.to_string());
                el.push_attribute(("frame_width", width.as_str()));
                el.push_attribute(("frame_height", height.as_str()));
                el.push_attribute(("width_in_pixels", flag(cb.width_in_pixels)));
                el.push_attribute(("syntax_highlighting", cb.syntax.as_str()));
                el.push_attribute(("highlight_brackets", flag(cb.highlight_brackets)));
                el.push_attribute(("show_line_numbers", flag(cb.show_line_numbers)));
                write_text_el(w, el, &cb.text)?;
            }
            WidgetKind::Table(table) => {
                let mut el = base("table");
                let (min, max) = (table.col_min.to_string(), table.col_max.to_string());
                el.push_attribute(("col_min", min.as_str()));
                el.push_attribute(("col_max", max.as_str()));
                write_table(w, el, table)?;
            }
            WidgetKind::Anchor { name } => {
                let mut el = base("encoded_png");
                el.push_attribute(("anchor", name.as_str()));
                w.write_event(Event::Empty(el))?;
            }
            kind => {
                let mut el = base("encoded_png");
                match kind {
                    WidgetKind::Image { link, .. } => el.push_attribute(("link", link.as_str())),
                    WidgetKind::Latex { .. } => el.push_attribute(("filename", LATEX_FILENAME)),
                    WidgetKind::EmbeddedFile { name, time, .. } => {
                        el.push_attribute(("filename", name.as_str()));
                        el.push_attribute(("time", time.to_string().as_str()));
                    }
                    _ => {}
                }
                let bytes = kind.blob().unwrap_or_default();
                let cached = blobs
                    .owner
                    .zip(blobs.cache)
                    .and_then(|(node, cache)| cache.get(WidgetKey { node, index }));
                match blobs.mode {
                    BlobMode::Inline => {
                        let encoded = match cached.and_then(|c| c.base64.clone()) {
                            Some(b) => b,
                            None => B64.encode(bytes),
                        };
                        write_text_el(w, el, &encoded)?;
                    }
                    BlobMode::Sha256 => {
                        let digest = match cached {
                            Some(c) => c.sha256.clone(),
                            None => super::cache::sha256_hex(bytes),
                        };
                        el.push_attribute(("sha256", digest.as_str()));
                        w.write_event(Event::Empty(el))?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Tables are stored as a nested `<table>` element: row-major `<row><cell>` lists.
pub(crate) fn write_table<W: Write>(w: &mut Writer<W>, el: BytesStart<'_>, table: &Table) -> Result<()> {
    w.write_event(Event::Start(el))?;
    for row in &table.rows {
        w.write_event(Event::Start(BytesStart::new("row")))?;
        for cell in row {
            write_text_el(w, BytesStart::new("cell"), cell)?;
        }
        w.write_event(Event::End(BytesEnd::new("row")))?;
    }
    w.write_event(Event::End(BytesEnd::new("table")))?;
    Ok(())
}

/// A `<table>` element on its own, as kept in the SQLite `grid.txt` column.
pub(crate) fn table_to_xml(table: &Table) -> Result<String> {
    let mut w = new_writer();
    let mut el = BytesStart::new("table");
    let (min, max) = (table.col_min.to_string(), table.col_max.to_string());
    el.push_attribute(("col_min", min.as_str()));
    el.push_attribute(("col_max", max.as_str()));
    write_table(&mut w, el, table)?;
    Ok(String::from_utf8(w.into_inner())?)
}

pub(crate) fn table_from_xml(xml: &str, col_min: i64, col_max: i64) -> Result<Table> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"table" => return read_table_body(&mut reader, col_min, col_max),
            Event::Empty(e) if e.name().as_ref() == b"table" => {
                return Ok(Table { col_min, col_max, rows: Vec::new() })
            }
            Event::Eof => bail!("no <table> element in grid data"),
            _ => {}
        }
    }
}

/// Rich text runs as a `<node>` fragment, as kept in the SQLite `node.txt` column.
pub(crate) fn rich_to_xml(segments: &[RichSegment]) -> Result<String> {
    let mut w = new_writer();
    write_decl(&mut w)?;
    w.write_event(Event::Start(BytesStart::new("node")))?;
    let content = NodeContent { text: TextContent::Rich(segments.to_vec()), widgets: Vec::new() };
    write_content(&mut w, &content, &BlobWrite { mode: BlobMode::Inline, cache: None, owner: None })?;
    write_node_end(&mut w)?;
    Ok(String::from_utf8(w.into_inner())?)
}

pub(crate) fn rich_from_xml(xml: &str) -> Result<Vec<RichSegment>> {
    let mut reader = Reader::from_str(xml);
    let mut segments = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"rich_text" => {
                let attrs: BTreeMap<String, String> = attrs_of(&e)?.into_iter().collect();
                let text = read_text(&mut reader, b"rich_text")?;
                if !text.is_empty() {
                    segments.push(RichSegment { text, attrs });
                }
            }
            Event::Eof => return Ok(segments),
            _ => {}
        }
    }
}

/// Comma-separated decimal ids, as in `subnodes.lst` and the bookmarks list.
pub(crate) fn format_id_list(ids: &[NodeId]) -> String {
    ids.iter().map(|id| id.0.to_string()).collect::<Vec<_>>().join(",")
}

pub(crate) fn parse_id_list(s: &str) -> Result<Vec<NodeId>> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<i64>().map(NodeId).with_context(|| format!("bad node id {p:?}")))
        .collect()
}

/// One `<node>` element as read back.
#[derive(Debug, Clone)]
pub(crate) struct ParsedNode {
    pub id: NodeId,
    pub master: Option<NodeId>,
    pub props: NodeProps,
    pub content: NodeContent,
    /// Index of the enclosing `<node>` in [`ParsedTree::nodes`].
    pub parent: Option<usize>,
}

#[derive(Debug, Default)]
pub(crate) struct ParsedTree {
    /// In document order, parents before children.
    pub nodes: Vec<ParsedNode>,
    pub bookmarks: Option<Vec<NodeId>>,
}

type Attrs = HashMap<String, String>;

fn attrs_of(e: &BytesStart<'_>) -> Result<Attrs> {
    let mut map = Attrs::new();
    for attr in e.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        map.insert(key, attr.unescape_value()?.into_owned());
    }
    Ok(map)
}

fn node_from_attrs(attrs: &Attrs, parent: Option<usize>) -> Result<ParsedNode> {
    let id: i64 = attrs
        .get("unique_id")
        .ok_or_else(|| anyhow!("<node> without unique_id"))?
        .trim()
        .parse()
        .context("bad unique_id")?;
    let master = attrs.get("master_id").and_then(|m| m.trim().parse::<i64>().ok()).filter(|m| *m > 0).map(NodeId);
    let props = NodeProps {
        name: attrs.get("name").cloned().unwrap_or_default(),
        syntax: attrs.get("prog_lang").cloned().unwrap_or_else(|| crate::document::node::SYNTAX_RICH_TEXT.to_string()),
        tags: attrs.get("tags").cloned().unwrap_or_default(),
        is_ro: parse_flag(attrs.get("readonly")),
        custom_icon_id: parse_num(attrs.get("custom_icon_id")),
        is_bold: parse_flag(attrs.get("is_bold")),
        foreground: attrs.get("foreground").filter(|f| !f.is_empty()).cloned(),
        exclude_from_search: parse_flag(attrs.get("nosearch_me")),
        exclude_children_from_search: parse_flag(attrs.get("nosearch_ch")),
        ts_creation: parse_num(attrs.get("ts_creation")),
        ts_lastsave: parse_num(attrs.get("ts_lastsave")),
    };
    let content = NodeContent::empty_for(&props.syntax);
    Ok(ParsedNode { id: NodeId(id), master, props, content, parent })
}

fn read_text(reader: &mut Reader<&[u8]>, tag: &[u8]) -> Result<String> {
    let mut text = String::new();
    loop {
        match reader.read_event()? {
            Event::Text(t) => text.push_str(&t.unescape()?),
            Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c)),
            Event::End(e) if e.name().as_ref() == tag => return Ok(text),
            Event::Eof => bail!("unexpected end of document inside <{}>", String::from_utf8_lossy(tag)),
            _ => {}
        }
    }
}

fn read_table_body(reader: &mut Reader<&[u8]>, col_min: i64, col_max: i64) -> Result<Table> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"row" => rows.push(Vec::new()),
            Event::Empty(e) if e.name().as_ref() == b"row" => rows.push(Vec::new()),
            Event::Start(e) if e.name().as_ref() == b"cell" => {
                let text = read_text(reader, b"cell")?;
                rows.last_mut().ok_or_else(|| anyhow!("<cell> outside <row>"))?.push(text);
            }
            Event::Empty(e) if e.name().as_ref() == b"cell" => {
                rows.last_mut().ok_or_else(|| anyhow!("<cell> outside <row>"))?.push(String::new());
            }
            Event::End(e) if e.name().as_ref() == b"table" => return Ok(Table { col_min, col_max, rows }),
            Event::Eof => bail!("unexpected end of document inside <table>"),
            _ => {}
        }
    }
}

fn offset_and_justification(attrs: &Attrs) -> (usize, Justification) {
    let offset = parse_num(attrs.get("char_offset"));
    let justification = attrs.get("justification").map(|j| Justification::parse(j)).unwrap_or_default();
    (offset, justification)
}

/// Builds the widget of an `<encoded_png>` element. `body` is the element text,
/// `load_blob(sha256, ext)` fetches externally stored payloads.
fn png_widget(
    attrs: &Attrs,
    body: &str,
    load_blob: &dyn Fn(&str, &str) -> Result<Vec<u8>>,
) -> Result<AnchoredWidget> {
    let (offset, justification) = offset_and_justification(attrs);
    let filename = attrs.get("filename").filter(|f| !f.is_empty());
    let mut kind = if let Some(anchor) = attrs.get("anchor").filter(|a| !a.is_empty()) {
        WidgetKind::Anchor { name: anchor.clone() }
    } else if filename.map(String::as_str) == Some(LATEX_FILENAME) {
        WidgetKind::Latex { source: String::new() }
    } else if let Some(name) = filename {
        WidgetKind::EmbeddedFile { name: name.clone(), data: Vec::new(), time: parse_num(attrs.get("time")) }
    } else {
        WidgetKind::Image { png: Vec::new(), link: attrs.get("link").cloned().unwrap_or_default() }
    };

    if !matches!(kind, WidgetKind::Anchor { .. }) {
        let bytes = match attrs.get("sha256") {
            Some(digest) => load_blob(digest, kind.blob_ext())?,
            None => {
                let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
                B64.decode(compact.as_bytes()).context("bad base64 payload")?
            }
        };
        match &mut kind {
            WidgetKind::Image { png, .. } => *png = bytes,
            WidgetKind::Latex { source } => *source = String::from_utf8(bytes).context("latex source is not utf-8")?,
            WidgetKind::EmbeddedFile { data, .. } => *data = bytes,
            _ => {}
        }
    }
    Ok(AnchoredWidget { offset, justification, kind })
}

fn codebox_widget(attrs: &Attrs, text: String) -> AnchoredWidget {
    let (offset, justification) = offset_and_justification(attrs);
    AnchoredWidget {
        offset,
        justification,
        kind: WidgetKind::CodeBox(CodeBox {
            text,
            syntax: attrs.get("syntax_highlighting").cloned().unwrap_or_else(|| "plain-text".to_string()),
            width: parse_num(attrs.get("frame_width")),
            height: parse_num(attrs.get("frame_height")),
            width_in_pixels: parse_flag(attrs.get("width_in_pixels")),
            highlight_brackets: parse_flag(attrs.get("highlight_brackets")),
            show_line_numbers: parse_flag(attrs.get("show_line_numbers")),
        }),
    }
}

fn push_text(content: &mut NodeContent, attrs: Attrs, text: String) {
    match &mut content.text {
        TextContent::Rich(segments) => {
            if !text.is_empty() {
                segments.push(RichSegment { text, attrs: attrs.into_iter().collect::<BTreeMap<_, _>>() });
            }
        }
        TextContent::Plain(plain) => plain.push_str(&text),
    }
}

/// One child element of `<node>`; consumes the element body from `reader` unless empty.
fn content_element(
    reader: &mut Reader<&[u8]>,
    content: &mut NodeContent,
    e: &BytesStart<'_>,
    is_empty: bool,
    load_blob: &dyn Fn(&str, &str) -> Result<Vec<u8>>,
) -> Result<()> {
    let name = e.name().as_ref().to_vec();
    let attrs = attrs_of(e)?;
    match name.as_slice() {
        b"table" => {
            let (offset, justification) = offset_and_justification(&attrs);
            let (min, max) = (parse_num(attrs.get("col_min")), parse_num(attrs.get("col_max")));
            let table = if is_empty {
                Table { col_min: min, col_max: max, rows: Vec::new() }
            } else {
                read_table_body(reader, min, max)?
            };
            content.widgets.push(AnchoredWidget { offset, justification, kind: WidgetKind::Table(table) });
        }
        _ => {
            let body = if is_empty { String::new() } else { read_text(reader, &name)? };
            match name.as_slice() {
                b"rich_text" => push_text(content, attrs, body),
                b"encoded_png" => content.widgets.push(png_widget(&attrs, &body, load_blob)?),
                b"codebox" => content.widgets.push(codebox_widget(&attrs, body)),
                other => log::debug!("skipping unknown element <{}>", String::from_utf8_lossy(other)),
            }
        }
    }
    Ok(())
}

/// Parses a `<cherrytree>` document or a single `<node>` fragment.
pub(crate) fn parse_tree(xml: &str, load_blob: &dyn Fn(&str, &str) -> Result<Vec<u8>>) -> Result<ParsedTree> {
    let mut reader = Reader::from_str(xml);
    let mut tree = ParsedTree::default();
    let mut open: Vec<usize> = Vec::new();
    let mut saw_root = false;

    loop {
        let event = reader.read_event().with_context(|| format!("XML error at byte {}", reader.buffer_position()))?;
        match event {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"bookmarks" => {
                let attrs = attrs_of(&e)?;
                tree.bookmarks = Some(parse_id_list(attrs.get("list").map(String::as_str).unwrap_or(""))?);
            }
            Event::Start(e) if e.name().as_ref() == b"cherrytree" => saw_root = true,
            Event::Start(e) if e.name().as_ref() == b"node" => {
                saw_root = true;
                let node = node_from_attrs(&attrs_of(&e)?, open.last().copied())?;
                tree.nodes.push(node);
                open.push(tree.nodes.len() - 1);
            }
            Event::Empty(e) if e.name().as_ref() == b"node" => {
                saw_root = true;
                let node = node_from_attrs(&attrs_of(&e)?, open.last().copied())?;
                tree.nodes.push(node);
            }
            Event::End(e) if e.name().as_ref() == b"node" => {
                open.pop().ok_or_else(|| anyhow!("unbalanced </node>"))?;
            }
            Event::Start(e) if !open.is_empty() => {
                let slot = open[open.len() - 1];
                content_element(&mut reader, &mut tree.nodes[slot].content, &e, false, load_blob)?;
            }
            Event::Empty(e) if !open.is_empty() => {
                let slot = open[open.len() - 1];
                content_element(&mut reader, &mut tree.nodes[slot].content, &e, true, load_blob)?;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !open.is_empty() {
        bail!("document ends inside an open <node>");
    }
    if !saw_root {
        bail!("no <cherrytree> or <node> root element");
    }
    for node in &mut tree.nodes {
        node.content.widgets.sort_by_key(|w| w.offset);
    }
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::node::SYNTAX_PLAIN_TEXT;

    fn no_blobs(_: &str, _: &str) -> Result<Vec<u8>> {
        bail!("no blob store")
    }

    fn sample_content() -> NodeContent {
        NodeContent {
            text: TextContent::Rich(vec![
                RichSegment::plain("a < b & "),
                RichSegment::plain("bold").with_attr("weight", "heavy"),
                RichSegment::plain("\n  indented\n"),
            ]),
            widgets: Vec::new(),
        }
        .with_widget(AnchoredWidget::new(1, WidgetKind::Image { png: vec![0, 1, 2, 250], link: "node 3".into() }))
        .with_widget(AnchoredWidget::new(2, WidgetKind::Anchor { name: "here".into() }))
        .with_widget(AnchoredWidget::new(3, WidgetKind::Latex { source: "\\frac{1}{2}".into() }))
        .with_widget(AnchoredWidget::new(4, WidgetKind::EmbeddedFile { name: "a.pdf".into(), data: vec![7; 10], time: 99 }))
        .with_widget(AnchoredWidget {
            offset: 5,
            justification: Justification::Center,
            kind: WidgetKind::CodeBox(CodeBox {
                text: "fn main() {}\n".into(),
                syntax: "rust".into(),
                width: 300,
                height: 100,
                width_in_pixels: true,
                highlight_brackets: true,
                show_line_numbers: false,
            }),
        })
        .with_widget(AnchoredWidget::new(
            6,
            WidgetKind::Table(Table {
                col_min: 40,
                col_max: 400,
                rows: vec![vec!["1".into(), String::new()], vec!["h1".into(), "h2".into()]],
            }),
        ))
    }

    fn encode_one(props: &NodeProps, content: &NodeContent, mode: BlobMode) -> String {
        let mut w = new_writer();
        write_node_start(&mut w, NodeId(7), None, props).unwrap();
        write_content(&mut w, content, &BlobWrite { mode, cache: None, owner: None }).unwrap();
        write_node_end(&mut w).unwrap();
        String::from_utf8(w.into_inner()).unwrap()
    }

    #[test]
    fn node_fragment_keeps_text_and_widgets() {
        let mut props = NodeProps::new("Node \"7\"");
        props.tags = "x,y".into();
        props.is_bold = true;
        props.foreground = Some("#ff0000".into());
        props.custom_icon_id = 12;
        let content = sample_content();

        let xml = encode_one(&props, &content, BlobMode::Inline);
        let tree = parse_tree(&xml, &no_blobs).unwrap();
        assert_eq!(tree.nodes.len(), 1);
        let node = &tree.nodes[0];
        assert_eq!(node.id, NodeId(7));
        assert_eq!(node.props, props);
        assert_eq!(node.content, content);
        assert!(tree.bookmarks.is_none());
    }

    #[test]
    fn sha256_mode_loads_blobs_through_callback() {
        let props = NodeProps::new("n");
        let content = NodeContent::rich("x")
            .with_widget(AnchoredWidget::new(0, WidgetKind::Image { png: vec![5, 5], link: String::new() }));
        let xml = encode_one(&props, &content, BlobMode::Sha256);
        let digest = crate::storage::cache::sha256_hex(&[5, 5]);
        assert!(xml.contains(&digest));

        let load = |sha: &str, ext: &str| -> Result<Vec<u8>> {
            assert_eq!(ext, "png");
            if sha == digest {
                Ok(vec![5, 5])
            } else {
                bail!("unknown blob")
            }
        };
        let tree = parse_tree(&xml, &load).unwrap();
        assert_eq!(tree.nodes[0].content, content);
        assert!(parse_tree(&xml, &no_blobs).is_err());
    }

    #[test]
    fn plain_text_node_and_nesting() {
        let xml = r#"<?xml version="1.0"?><cherrytree><bookmarks list="2,1"/><node name="A" unique_id="1" prog_lang="plain-text"><rich_text>  two  spaces </rich_text><node name="B" unique_id="2" master_id="1"/></node></cherrytree>"#;
        let tree = parse_tree(xml, &no_blobs).unwrap();
        assert_eq!(tree.bookmarks, Some(vec![NodeId(2), NodeId(1)]));
        assert_eq!(tree.nodes[0].props.syntax, SYNTAX_PLAIN_TEXT);
        assert_eq!(tree.nodes[0].content.text, TextContent::Plain("  two  spaces ".into()));
        assert_eq!(tree.nodes[1].parent, Some(0));
        assert_eq!(tree.nodes[1].master, Some(NodeId(1)));
    }

    #[test]
    fn malformed_documents_fail() {
        assert!(parse_tree("<node name='x' unique_id='1'><rich_text>open", &no_blobs).is_err());
        assert!(parse_tree("<node name='x'></node>", &no_blobs).is_err());
        assert!(parse_tree("", &no_blobs).is_err());
    }

    #[test]
    fn grid_table_xml() {
        let table = Table { col_min: 1, col_max: 2, rows: vec![vec!["a&b".into(), "<c>".into()]] };
        let xml = table_to_xml(&table).unwrap();
        assert_eq!(table_from_xml(&xml, 1, 2).unwrap(), table);
    }

    #[test]
    fn rich_fragment() {
        let segs = vec![RichSegment::plain("x "), RichSegment::plain("y").with_attr("style", "italic")];
        let xml = rich_to_xml(&segs).unwrap();
        assert!(xml.starts_with("<?xml"));
        assert_eq!(rich_from_xml(&xml).unwrap(), segs);
        assert!(rich_from_xml("<node/>").unwrap().is_empty());
    }

    #[test]
    fn id_lists() {
        assert_eq!(parse_id_list("3, 1,2").unwrap(), vec![NodeId(3), NodeId(1), NodeId(2)]);
        assert!(parse_id_list("").unwrap().is_empty());
        assert!(parse_id_list("1,x").is_err());
        assert_eq!(format_id_list(&[NodeId(4), NodeId(5)]), "4,5");
    }
}
