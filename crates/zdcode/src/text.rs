//! Line-oriented output building for DECORATE emission.
//!
//! Emission composes a recursive [`TextNode`] tree where every node carries an
//! indent level applied to each line of its children; the final render expands
//! tabs to a caller-chosen width.

use std::fmt;

/// One entry of a [`TextNode`]: either a literal line or a nested node.
#[derive(Debug, Clone)]
pub(crate) enum TextChunk {
    Line(String),
    Node(TextNode),
}

/// A recursive line-wise text structure.
///
/// Rendering joins the chunks with newlines, prefixing every produced line
/// (including those of nested nodes, which have already applied their own
/// indent) with this node's indent. Indentation therefore accumulates with
/// nesting depth.
#[derive(Debug, Clone)]
pub(crate) struct TextNode {
    chunks: Vec<TextChunk>,
    indent: usize,
}

impl TextNode {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            indent: 1,
        }
    }

    pub fn with_indent(indent: usize) -> Self {
        Self {
            chunks: Vec::new(),
            indent,
        }
    }

    /// Adds a literal line.
    pub fn add_line(&mut self, line: impl Into<String>) {
        self.chunks.push(TextChunk::Line(line.into()));
    }

    /// Adds a nested node.
    pub fn add_node(&mut self, node: TextNode) {
        self.chunks.push(TextChunk::Node(node));
    }

    fn render_into(&self, out: &mut Vec<String>, extra: usize) {
        let indent = extra + self.indent;
        for chunk in &self.chunks {
            match chunk {
                TextChunk::Line(line) => {
                    for part in line.split('\n') {
                        out.push(format!("{}{}", "\t".repeat(indent), part));
                    }
                }
                TextChunk::Node(node) => node.render_into(out, indent),
            }
        }
    }

    /// Renders to a string, expanding tabs to `tab_size` spaces.
    ///
    /// The top node's own indent is not applied, matching how a document root
    /// is rendered flush-left while nested nodes indent their contents.
    pub fn to_string_with_tab(&self, tab_size: usize) -> String {
        let mut lines = Vec::new();
        for chunk in &self.chunks {
            match chunk {
                TextChunk::Line(line) => {
                    for part in line.split('\n') {
                        lines.push(part.to_string());
                    }
                }
                TextChunk::Node(node) => node.render_into(&mut lines, 0),
            }
        }
        lines.join("\n").replace('\t', &" ".repeat(tab_size))
    }
}

impl fmt::Display for TextNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines = Vec::new();
        self.render_into(&mut lines, 0);
        write!(f, "{}", lines.join("\n"))
    }
}

/// Adds double quotes around `content` unless it is already quoted.
pub(crate) fn stringify(content: &str) -> String {
    let bytes = content.as_bytes();
    if content.len() > 1 {
        let first = bytes[0];
        if (first == b'"' || first == b'\'') && bytes[bytes.len() - 1] == first {
            return content.to_string();
        }
    }
    let mut out = String::with_capacity(content.len() + 2);
    out.push('"');
    for ch in content.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// Removes matching quotes around `content`, if any.
pub(crate) fn unstringify(content: &str) -> &str {
    let bytes = content.as_bytes();
    if content.len() > 1 {
        let first = bytes[0];
        if (first == b'"' || first == b'\'') && bytes[bytes.len() - 1] == first {
            return &content[1..content.len() - 1];
        }
    }
    content
}
