use serde::{Deserialize, Serialize};

/// Syntax tag of rich-text nodes.
pub const SYNTAX_RICH_TEXT: &str = "custom-colors";
/// Syntax tag of plain-text nodes.
pub const SYNTAX_PLAIN_TEXT: &str = "plain-text";

/// Properties of a node. Shared aliases have none of their own; they read the master's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProps {
    pub name: String,
    /// `custom-colors` for rich text, `plain-text`, or a code language.
    pub syntax: String,
    pub tags: String,
    pub is_ro: bool,
    pub custom_icon_id: u32,
    pub is_bold: bool,
    /// Foreground colour as `#rrggbb`.
    pub foreground: Option<String>,
    pub exclude_from_search: bool,
    pub exclude_children_from_search: bool,
    pub ts_creation: i64,
    pub ts_lastsave: i64,
}

impl Default for NodeProps {
    fn default() -> Self {
        Self {
            name: String::new(),
            syntax: SYNTAX_RICH_TEXT.to_string(),
            tags: String::new(),
            is_ro: false,
            custom_icon_id: 0,
            is_bold: false,
            foreground: None,
            exclude_from_search: false,
            exclude_children_from_search: false,
            ts_creation: 0,
            ts_lastsave: 0,
        }
    }
}

impl NodeProps {
    pub fn new<S: Into<String>>(name: S) -> Self {
        let now = super::now_ts();
        Self {
            name: name.into(),
            ts_creation: now,
            ts_lastsave: now,
            ..Self::default()
        }
    }

    pub fn with_syntax<S: Into<String>>(mut self, syntax: S) -> Self {
        self.syntax = syntax.into();
        self
    }

    pub fn is_rich_text(&self) -> bool {
        self.syntax == SYNTAX_RICH_TEXT
    }

    /// Foreground as a packed 24-bit RGB value, if set and well formed.
    pub fn foreground_rgb24(&self) -> Option<u32> {
        let fg = self.foreground.as_deref()?;
        let hex = fg.strip_prefix('#')?;
        match hex.len() {
            6 => u32::from_str_radix(hex, 16).ok(),
            // #rrrrggggbbbb, keep the high byte of each channel
            12 => {
                let r = u32::from_str_radix(&hex[0..2], 16).ok()?;
                let g = u32::from_str_radix(&hex[4..6], 16).ok()?;
                let b = u32::from_str_radix(&hex[8..10], 16).ok()?;
                Some((r << 16) | (g << 8) | b)
            }
            _ => None,
        }
    }

    pub fn set_foreground_rgb24(&mut self, rgb: u32) {
        self.foreground = Some(format!("#{:06x}", rgb & 0xff_ffff));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_node_is_rich_text_with_timestamps() {
        let p = NodeProps::new("A");
        assert!(p.is_rich_text());
        assert!(p.ts_creation > 0);
        assert_eq!(p.ts_creation, p.ts_lastsave);
    }

    #[test]
    fn foreground_packing() {
        let mut p = NodeProps::new("A");
        assert_eq!(p.foreground_rgb24(), None);

        p.set_foreground_rgb24(0x12ab34);
        assert_eq!(p.foreground.as_deref(), Some("#12ab34"));
        assert_eq!(p.foreground_rgb24(), Some(0x12ab34));

        p.foreground = Some("#ffff00000000".into());
        assert_eq!(p.foreground_rgb24(), Some(0xff0000));

        p.foreground = Some("red".into());
        assert_eq!(p.foreground_rgb24(), None);
    }
}
