use std::collections::BTreeMap;

use super::node::SYNTAX_RICH_TEXT;

/// A run of rich text sharing one set of formatting attributes
/// (`weight`, `foreground`, `link`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RichSegment {
    pub text: String,
    pub attrs: BTreeMap<String, String>,
}

impl RichSegment {
    pub fn plain<S: Into<String>>(text: S) -> Self {
        Self { text: text.into(), attrs: BTreeMap::new() }
    }

    pub fn with_attr<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextContent {
    Rich(Vec<RichSegment>),
    /// Plain text and code.
    Plain(String),
}

impl TextContent {
    pub fn empty_for(syntax: &str) -> Self {
        if syntax == SYNTAX_RICH_TEXT {
            TextContent::Rich(Vec::new())
        } else {
            TextContent::Plain(String::new())
        }
    }

    /// The text with all formatting dropped.
    pub fn plain_text(&self) -> String {
        match self {
            TextContent::Rich(segments) => segments.iter().map(|s| s.text.as_str()).collect(),
            TextContent::Plain(text) => text.clone(),
        }
    }

    pub fn char_count(&self) -> usize {
        match self {
            TextContent::Rich(segments) => segments.iter().map(|s| s.text.chars().count()).sum(),
            TextContent::Plain(text) => text.chars().count(),
        }
    }

    /// Characters in `[start, end)`. Offsets past the end are clamped.
    pub fn slice(&self, start: usize, end: usize) -> TextContent {
        match self {
            TextContent::Plain(text) => TextContent::Plain(slice_chars(text, start, end)),
            TextContent::Rich(segments) => {
                let mut out = Vec::new();
                let mut pos = 0usize;
                for seg in segments {
                    let len = seg.text.chars().count();
                    let seg_start = pos;
                    let seg_end = pos + len;
                    pos = seg_end;
                    if seg_end <= start || seg_start >= end {
                        continue;
                    }
                    let from = start.saturating_sub(seg_start);
                    let to = end.min(seg_end) - seg_start;
                    let text = slice_chars(&seg.text, from, to);
                    if !text.is_empty() {
                        out.push(RichSegment { text, attrs: seg.attrs.clone() });
                    }
                }
                TextContent::Rich(out)
            }
        }
    }
}

fn slice_chars(text: &str, start: usize, end: usize) -> String {
    if end <= start {
        return String::new();
    }
    text.chars().skip(start).take(end - start).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Justification {
    #[default]
    Left,
    Center,
    Right,
    Fill,
}

impl Justification {
    pub fn as_str(self) -> &'static str {
        match self {
            Justification::Left => "left",
            Justification::Center => "center",
            Justification::Right => "right",
            Justification::Fill => "fill",
        }
    }

    /// Unknown values fall back to `Left`.
    pub fn parse(s: &str) -> Self {
        match s {
            "center" => Justification::Center,
            "right" => Justification::Right,
            "fill" => Justification::Fill,
            _ => Justification::Left,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBox {
    pub text: String,
    pub syntax: String,
    pub width: i64,
    pub height: i64,
    pub width_in_pixels: bool,
    pub highlight_brackets: bool,
    pub show_line_numbers: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub col_min: i64,
    pub col_max: i64,
    /// Row-major cells. The header row is stored last, as on disk.
    pub rows: Vec<Vec<String>>,
}

/// Embedded object kinds. On disk the first four share the SQLite `image` table and the
/// XML `<encoded_png>` element, told apart by which of `anchor`/`filename`/`link` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidgetKind {
    Image { png: Vec<u8>, link: String },
    Latex { source: String },
    EmbeddedFile { name: String, data: Vec<u8>, time: i64 },
    Anchor { name: String },
    CodeBox(CodeBox),
    Table(Table),
}

impl WidgetKind {
    /// Binary payload stored as a blob on disk, if the kind has one.
    pub fn blob(&self) -> Option<&[u8]> {
        match self {
            WidgetKind::Image { png, .. } => Some(png),
            WidgetKind::Latex { source } => Some(source.as_bytes()),
            WidgetKind::EmbeddedFile { data, .. } => Some(data),
            _ => None,
        }
    }

    /// File extension used for content-addressed blob files.
    pub fn blob_ext(&self) -> &str {
        match self {
            WidgetKind::Image { .. } => "png",
            WidgetKind::Latex { .. } => "tex",
            WidgetKind::EmbeddedFile { name, .. } => std::path::Path::new(name)
                .extension()
                .and_then(|e| e.to_str())
                .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
                .unwrap_or("bin"),
            _ => "bin",
        }
    }
}

/// An embedded object anchored at a character offset of the node text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchoredWidget {
    pub offset: usize,
    pub justification: Justification,
    pub kind: WidgetKind,
}

impl AnchoredWidget {
    pub fn new(offset: usize, kind: WidgetKind) -> Self {
        Self { offset, justification: Justification::Left, kind }
    }
}

/// A node's text buffer plus its anchored widgets, ordered by offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeContent {
    pub text: TextContent,
    pub widgets: Vec<AnchoredWidget>,
}

impl NodeContent {
    pub fn empty_for(syntax: &str) -> Self {
        Self { text: TextContent::empty_for(syntax), widgets: Vec::new() }
    }

    pub fn rich<S: Into<String>>(text: S) -> Self {
        Self { text: TextContent::Rich(vec![RichSegment::plain(text)]), widgets: Vec::new() }
    }

    pub fn plain<S: Into<String>>(text: S) -> Self {
        Self { text: TextContent::Plain(text.into()), widgets: Vec::new() }
    }

    pub fn with_widget(mut self, widget: AnchoredWidget) -> Self {
        self.widgets.push(widget);
        self.widgets.sort_by_key(|w| w.offset);
        self
    }

    pub fn has_codebox(&self) -> bool {
        self.widgets.iter().any(|w| matches!(w.kind, WidgetKind::CodeBox(_)))
    }

    pub fn has_table(&self) -> bool {
        self.widgets.iter().any(|w| matches!(w.kind, WidgetKind::Table(_)))
    }

    pub fn has_image(&self) -> bool {
        self.widgets.iter().any(|w| {
            matches!(
                w.kind,
                WidgetKind::Image { .. } | WidgetKind::Latex { .. } | WidgetKind::EmbeddedFile { .. } | WidgetKind::Anchor { .. }
            )
        })
    }

    /// The `[start, end)` character range, with widgets in range re-anchored at the new start.
    pub fn slice(&self, start: usize, end: usize) -> NodeContent {
        let widgets = self
            .widgets
            .iter()
            .filter(|w| w.offset >= start && w.offset < end)
            .map(|w| AnchoredWidget { offset: w.offset - start, ..w.clone() })
            .collect();
        NodeContent { text: self.text.slice(start, end), widgets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rich_slice_crosses_segments_and_keeps_attrs() {
        let text = TextContent::Rich(vec![
            RichSegment::plain("hello "),
            RichSegment::plain("bold").with_attr("weight", "heavy"),
            RichSegment::plain(" world"),
        ]);
        assert_eq!(text.char_count(), 16);

        let sliced = text.slice(3, 8);
        assert_eq!(sliced.plain_text(), "lo bo");
        match sliced {
            TextContent::Rich(segs) => {
                assert_eq!(segs.len(), 2);
                assert_eq!(segs[1].attrs.get("weight").map(String::as_str), Some("heavy"));
            }
            _ => panic!("expected rich text"),
        }
    }

    #[test]
    fn plain_slice_is_char_based() {
        let text = TextContent::Plain("héllo wörld".into());
        assert_eq!(text.slice(1, 5).plain_text(), "éllo");
        assert_eq!(text.slice(8, 100).plain_text(), "rld");
        assert_eq!(text.slice(5, 2).plain_text(), "");
    }

    #[test]
    fn content_slice_shifts_widgets_in_range() {
        let content = NodeContent::plain("0123456789")
            .with_widget(AnchoredWidget::new(2, WidgetKind::Anchor { name: "a".into() }))
            .with_widget(AnchoredWidget::new(5, WidgetKind::Anchor { name: "b".into() }))
            .with_widget(AnchoredWidget::new(9, WidgetKind::Anchor { name: "c".into() }));

        let sliced = content.slice(4, 9);
        assert_eq!(sliced.text.plain_text(), "45678");
        assert_eq!(sliced.widgets.len(), 1);
        assert_eq!(sliced.widgets[0].offset, 1);
        assert!(sliced.has_image());
        assert!(!sliced.has_table());
    }

    #[test]
    fn embedded_file_blob_ext() {
        let kind = WidgetKind::EmbeddedFile { name: "report.pdf".into(), data: vec![1], time: 0 };
        assert_eq!(kind.blob_ext(), "pdf");
        let kind = WidgetKind::EmbeddedFile { name: "noext".into(), data: vec![1], time: 0 };
        assert_eq!(kind.blob_ext(), "bin");
        assert_eq!(WidgetKind::Anchor { name: "x".into() }.blob(), None);
    }
}
