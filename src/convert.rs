// ABOUTME: Converts note HTML to Markdown with inline media extraction
// ABOUTME: Internal failures degrade to a verbatim fallback document

use crate::model::{ExtractedMedia, NoteSummary};
use crate::util::short_hash;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ego_tree::NodeRef;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::node::Node;
use scraper::Html;
use tracing::warn;

const MAX_DEPTH: usize = 128;

/// Outcome of one conversion. Both variants satisfy the same downstream
/// contract: a document to write, media to place beside it. A fallback always
/// carries the original markup verbatim so nothing is ever lost.
#[derive(Debug)]
pub enum Conversion {
    Converted {
        markdown: String,
        media: Vec<ExtractedMedia>,
    },
    Fallback {
        markdown: String,
    },
}

impl Conversion {
    pub fn markdown(&self) -> &str {
        match self {
            Conversion::Converted { markdown, .. } => markdown,
            Conversion::Fallback { markdown } => markdown,
        }
    }

    pub fn into_parts(self) -> (String, Vec<ExtractedMedia>) {
        match self {
            Conversion::Converted { markdown, media } => (markdown, media),
            Conversion::Fallback { markdown } => (markdown, Vec::new()),
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Conversion::Fallback { .. })
    }
}

#[derive(Debug, thiserror::Error)]
enum ConvertError {
    #[error("markup nesting exceeds {MAX_DEPTH} levels")]
    TooDeep,
    #[error("document rendered to nothing")]
    Empty,
}

pub struct Converter {
    extract_images: bool,
    add_metadata: bool,
}

impl Converter {
    pub fn new(extract_images: bool, add_metadata: bool) -> Self {
        Converter {
            extract_images,
            add_metadata,
        }
    }

    /// Convert note HTML to Markdown. Never fails: any internal error yields
    /// a fallback document with the input fenced verbatim and no media.
    pub fn convert(&self, html: &str, note: &NoteSummary, resources: &[String]) -> Conversion {
        match self.try_convert(html, note, resources) {
            Ok((markdown, media)) => Conversion::Converted { markdown, media },
            Err(e) => {
                warn!(title = note.display_title(), error = %e, "conversion failed, keeping original markup");
                Conversion::Fallback {
                    markdown: fallback_document(html, note),
                }
            }
        }
    }

    fn try_convert(
        &self,
        html: &str,
        note: &NoteSummary,
        resources: &[String],
    ) -> Result<(String, Vec<ExtractedMedia>), ConvertError> {
        let doc = Html::parse_document(html);
        let root = doc.tree.root();
        let body = root
            .descendants()
            .find(|n| element_name(n) == Some("body"))
            .unwrap_or(root);

        let mut renderer = Renderer::new(self.extract_images, resources);
        renderer.walk_children(body)?;

        let body_text = postprocess(&renderer.out);
        if body_text.trim().is_empty() && !html.trim().is_empty() {
            return Err(ConvertError::Empty);
        }

        let markdown = if self.add_metadata {
            format!("{}{}", front_matter(note), body_text)
        } else {
            body_text
        };

        Ok((markdown, renderer.media))
    }

    /// Pass-through path for notes already stored as Markdown: strip stray
    /// HTML tags, normalize blank runs, and prepend front-matter unless the
    /// body already starts with a front-matter delimiter.
    pub fn process_markdown(&self, content: &str, note: &NoteSummary) -> String {
        let cleaned = clean_markdown(content);
        if self.add_metadata && !cleaned.starts_with("---\n") {
            format!("{}{}", front_matter(note), cleaned)
        } else {
            cleaned
        }
    }
}

fn element_name<'a>(node: &NodeRef<'a, Node>) -> Option<&'a str> {
    node.value().as_element().map(|e| e.name())
}

fn fallback_document(html: &str, note: &NoteSummary) -> String {
    format!(
        "# {}\n\nConversion failed; original markup follows.\n\n```html\n{}\n```\n",
        note.display_title(),
        html
    )
}

/// Key-value header block. Missing fields are omitted, never rendered empty;
/// the tag list is always a bracketed comma join.
fn front_matter(note: &NoteSummary) -> String {
    let mut lines = vec!["---".to_string(), format!("title: {}", note.display_title())];
    if let Some(created) = &note.created {
        lines.push(format!("created: {}", created));
    }
    if let Some(modified) = &note.modified {
        lines.push(format!("modified: {}", modified));
    }
    if !note.tags.is_empty() {
        lines.push(format!("tags: [{}]", note.tags.join(", ")));
    }
    if let Some(author) = &note.author {
        lines.push(format!("author: {}", author));
    }
    lines.push("---".into());
    lines.push(String::new());
    lines.join("\n")
}

fn clean_markdown(content: &str) -> String {
    static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("static regex"));
    let mut s = TAG.replace_all(content, "").into_owned();
    while s.contains("\n\n\n") {
        s = s.replace("\n\n\n", "\n\n");
    }
    format!("{}\n", s.trim())
}

/// Whitespace normalization applied after rendering: trailing whitespace
/// trimmed per line, blank runs collapsed, blank lines hugging fence
/// boundaries removed, exactly one trailing newline.
fn postprocess(content: &str) -> String {
    let mut s = content
        .lines()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n");

    while s.contains("\n\n\n") {
        s = s.replace("\n\n\n", "\n\n");
    }

    loop {
        let next = s.replace("```\n\n", "```\n").replace("\n\n```", "\n```");
        if next == s {
            break;
        }
        s = next;
    }

    let mut s = s.trim_matches('\n').to_string();
    s.push('\n');
    s
}

enum ListKind {
    Unordered,
    Ordered(usize),
}

struct Renderer<'a> {
    out: String,
    media: Vec<ExtractedMedia>,
    extract_images: bool,
    resources: &'a [String],
    list_stack: Vec<ListKind>,
    depth: usize,
}

impl<'a> Renderer<'a> {
    fn new(extract_images: bool, resources: &'a [String]) -> Self {
        Renderer {
            out: String::new(),
            media: Vec::new(),
            extract_images,
            resources,
            list_stack: Vec::new(),
            depth: 0,
        }
    }

    fn walk_children(&mut self, node: NodeRef<Node>) -> Result<(), ConvertError> {
        for child in node.children() {
            self.walk(child)?;
        }
        Ok(())
    }

    fn walk(&mut self, node: NodeRef<Node>) -> Result<(), ConvertError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ConvertError::TooDeep);
        }
        let result = self.walk_node(node);
        self.depth -= 1;
        result
    }

    fn walk_node(&mut self, node: NodeRef<Node>) -> Result<(), ConvertError> {
        match node.value() {
            Node::Text(text) => {
                self.push_text(&text.text);
                Ok(())
            }
            Node::Element(el) => {
                // Only href, src, alt, and title are ever read off an
                // element; every other attribute is dropped with the markup.
                let name = el.name().to_ascii_lowercase();
                match name.as_str() {
                    "head" | "script" | "style" | "meta" | "link" | "title" => Ok(()),
                    "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                        let level = name.as_bytes()[1] - b'0';
                        let text = self.capture(node)?;
                        self.ensure_block();
                        for _ in 0..level {
                            self.out.push('#');
                        }
                        self.out.push(' ');
                        self.out.push_str(text.trim());
                        self.end_block();
                        Ok(())
                    }
                    "p" | "div" | "section" | "article" | "main" | "figure" => {
                        self.ensure_block();
                        self.walk_children(node)?;
                        self.end_block();
                        Ok(())
                    }
                    "br" => {
                        self.out.push('\n');
                        Ok(())
                    }
                    "hr" => {
                        self.ensure_block();
                        self.out.push_str("---");
                        self.end_block();
                        Ok(())
                    }
                    "strong" | "b" => self.wrap_inline(node, "**"),
                    "em" | "i" => self.wrap_inline(node, "*"),
                    "del" | "s" | "strike" => self.wrap_inline(node, "~~"),
                    "code" => self.wrap_inline(node, "`"),
                    "a" => {
                        let href = el.attr("href").map(str::to_string);
                        let title = el.attr("title").map(str::to_string);
                        let text = self.capture(node)?;
                        let text = text.trim();
                        match href {
                            Some(href) if !href.is_empty() => {
                                let label = if text.is_empty() { href.as_str() } else { text };
                                match title {
                                    Some(t) => self.out.push_str(&format!(
                                        "[{}]({} \"{}\")",
                                        label, href, t
                                    )),
                                    None => {
                                        self.out.push_str(&format!("[{}]({})", label, href))
                                    }
                                }
                            }
                            _ => self.out.push_str(text),
                        }
                        Ok(())
                    }
                    "img" => {
                        let src = el.attr("src").unwrap_or("");
                        let alt = el.attr("alt").unwrap_or("");
                        let rewritten = self.rewrite_src(src);
                        if !rewritten.is_empty() {
                            self.out.push_str(&format!("![{}]({})", alt, rewritten));
                        }
                        Ok(())
                    }
                    "pre" => self.render_pre(node),
                    "ul" => self.render_list(node, ListKind::Unordered),
                    "ol" => self.render_list(node, ListKind::Ordered(0)),
                    "li" => {
                        if !self.out.is_empty() && !self.out.ends_with('\n') {
                            self.out.push('\n');
                        }
                        let indent = "  ".repeat(self.list_stack.len().saturating_sub(1));
                        self.out.push_str(&indent);
                        match self.list_stack.last_mut() {
                            Some(ListKind::Ordered(n)) => {
                                *n += 1;
                                let marker = format!("{}. ", n);
                                self.out.push_str(&marker);
                            }
                            _ => self.out.push_str("- "),
                        }
                        self.walk_children(node)
                    }
                    "blockquote" => {
                        let inner = self.capture(node)?;
                        self.ensure_block();
                        for line in inner.trim().lines() {
                            self.out.push_str("> ");
                            self.out.push_str(line.trim_end());
                            self.out.push('\n');
                        }
                        self.end_block();
                        Ok(())
                    }
                    "table" => self.render_table(node),
                    _ => self.walk_children(node),
                }
            }
            _ => Ok(()),
        }
    }

    fn wrap_inline(&mut self, node: NodeRef<Node>, delim: &str) -> Result<(), ConvertError> {
        let text = self.capture(node)?;
        let text = text.trim();
        if !text.is_empty() {
            self.out.push_str(delim);
            self.out.push_str(text);
            self.out.push_str(delim);
        }
        Ok(())
    }

    /// Render a subtree to its own string; media extraction still accumulates
    /// on self.
    fn capture(&mut self, node: NodeRef<Node>) -> Result<String, ConvertError> {
        let saved = std::mem::take(&mut self.out);
        let result = self.walk_children(node);
        let captured = std::mem::replace(&mut self.out, saved);
        result.map(|_| captured)
    }

    fn push_text(&mut self, text: &str) {
        let mut last_ws = self.out.is_empty()
            || self
                .out
                .ends_with(|c: char| c.is_whitespace());
        for ch in text.chars() {
            if ch.is_whitespace() {
                if !last_ws {
                    self.out.push(' ');
                    last_ws = true;
                }
            } else {
                self.out.push(ch);
                last_ws = false;
            }
        }
    }

    fn ensure_block(&mut self) {
        while self.out.ends_with(' ') {
            self.out.pop();
        }
        if self.out.is_empty() {
            return;
        }
        while !self.out.ends_with("\n\n") {
            self.out.push('\n');
        }
    }

    fn end_block(&mut self) {
        while self.out.ends_with(' ') {
            self.out.pop();
        }
        if !self.out.is_empty() && !self.out.ends_with("\n\n") {
            self.out.push('\n');
            if !self.out.ends_with("\n\n") {
                self.out.push('\n');
            }
        }
    }

    /// Rewrites an image reference per the media rules: inline base64 data is
    /// decoded and content-addressed, bundled resource names move under
    /// `./assets/`, remote URLs pass through.
    fn rewrite_src(&mut self, src: &str) -> String {
        if !self.extract_images {
            return src.to_string();
        }

        if src.starts_with("data:image") {
            if let Some(media) = decode_data_image(src) {
                let path = format!("./assets/{}", media.filename);
                self.media.push(media);
                return path;
            }
            return src.to_string();
        }

        let name = basename(src);
        if src.starts_with("index_files/")
            || src.contains("resources/")
            || self.resources.iter().any(|r| r == name)
        {
            return format!("./assets/{}", name);
        }

        src.to_string()
    }

    fn render_pre(&mut self, node: NodeRef<Node>) -> Result<(), ConvertError> {
        let mut lang = String::new();
        let mut source = node;
        for d in node.descendants() {
            if let Some(el) = d.value().as_element() {
                if el.name() == "code" {
                    for class in el.classes() {
                        if let Some(l) = class.strip_prefix("language-") {
                            lang = l.to_string();
                        }
                    }
                    source = d;
                    break;
                }
            }
        }

        let code = raw_text(source);
        self.ensure_block();
        self.out.push_str("```");
        self.out.push_str(&lang);
        self.out.push('\n');
        self.out.push_str(code.trim_matches('\n'));
        self.out.push('\n');
        self.out.push_str("```");
        self.end_block();
        Ok(())
    }

    fn render_list(&mut self, node: NodeRef<Node>, kind: ListKind) -> Result<(), ConvertError> {
        if self.list_stack.is_empty() {
            self.ensure_block();
        }
        self.list_stack.push(kind);
        let result = self.walk_children(node);
        self.list_stack.pop();
        if self.list_stack.is_empty() {
            self.end_block();
        }
        result?;
        Ok(())
    }

    fn render_table(&mut self, node: NodeRef<Node>) -> Result<(), ConvertError> {
        let mut rows: Vec<Vec<String>> = Vec::new();
        for d in node.descendants() {
            if element_name(&d) != Some("tr") {
                continue;
            }
            let mut cells = Vec::new();
            for c in d.children() {
                match element_name(&c) {
                    Some("td") | Some("th") => {
                        let text = self.capture(c)?;
                        cells.push(text.trim().replace('\n', " ").replace('|', "\\|"));
                    }
                    _ => {}
                }
            }
            if !cells.is_empty() {
                rows.push(cells);
            }
        }

        if rows.is_empty() {
            return Ok(());
        }

        // With no explicit header the first row is promoted to one, so the
        // renderer can always tell header from body.
        let header = rows.remove(0);
        self.ensure_block();
        self.out.push_str(&format!("| {} |\n", header.join(" | ")));
        self.out.push_str(&format!(
            "| {} |\n",
            header.iter().map(|_| "---").collect::<Vec<_>>().join(" | ")
        ));
        for row in rows {
            self.out.push_str(&format!("| {} |\n", row.join(" | ")));
        }
        self.end_block();
        Ok(())
    }
}

fn raw_text(node: NodeRef<Node>) -> String {
    let mut out = String::new();
    for n in node.descendants() {
        if let Some(t) = n.value().as_text() {
            out.push_str(&t.text);
        }
    }
    out
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Decode a `data:image/<type>;base64,…` URI into content-addressed media.
/// The filename hash comes from the decoded bytes, so identical images
/// collapse to the same name across notes and runs.
fn decode_data_image(src: &str) -> Option<ExtractedMedia> {
    let rest = src.strip_prefix("data:image/")?;
    let (ext, data) = rest.split_once(";base64,")?;
    let compact: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD.decode(compact).ok()?;
    let filename = format!("image_{}.{}", short_hash(&bytes), ext);
    Some(ExtractedMedia { filename, bytes })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note() -> NoteSummary {
        serde_json::from_str(
            r#"{
                "guid": "n1",
                "title": "Test Note",
                "created": "2024-01-01 10:00:00",
                "modified": "2024-01-01 11:00:00",
                "tags": ["alpha", "beta"]
            }"#,
        )
        .unwrap()
    }

    fn converter() -> Converter {
        Converter::new(true, true)
    }

    // 1x1 transparent PNG
    const PNG_B64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

    #[test]
    fn test_basic_blocks() {
        let html = "<h1>Heading</h1><p>A <strong>bold</strong> and <em>italic</em> bit.</p>";
        let conv = converter().convert(html, &note(), &[]);
        assert!(!conv.is_fallback());
        let md = conv.markdown();
        assert!(md.contains("# Heading"));
        assert!(md.contains("**bold**"));
        assert!(md.contains("*italic*"));
    }

    #[test]
    fn test_front_matter_fields() {
        let conv = converter().convert("<p>x</p>", &note(), &[]);
        let md = conv.markdown();
        assert!(md.starts_with("---\n"));
        assert!(md.contains("title: Test Note"));
        assert!(md.contains("created: 2024-01-01 10:00:00"));
        assert!(md.contains("tags: [alpha, beta]"));
        // no author on this note, so no author line at all
        assert!(!md.contains("author:"));
    }

    #[test]
    fn test_front_matter_single_string_tag() {
        let note: NoteSummary =
            serde_json::from_str(r#"{"guid": "t", "title": "T", "tags": "solo"}"#).unwrap();
        let conv = converter().convert("<p>x</p>", &note, &[]);
        assert!(conv.markdown().contains("tags: [solo]"));
    }

    #[test]
    fn test_no_front_matter_when_disabled() {
        let conv = Converter::new(true, false).convert("<p>x</p>", &note(), &[]);
        assert!(!conv.markdown().starts_with("---"));
    }

    #[test]
    fn test_code_block_language() {
        let html = r#"<pre><code class="language-python">def f():
    pass</code></pre>"#;
        let md = converter().convert(html, &note(), &[]).into_parts().0;
        assert!(md.contains("```python\ndef f():\n    pass\n```"));
    }

    #[test]
    fn test_plain_pre_gets_unlabeled_fence() {
        let html = "<pre>raw text</pre>";
        let md = converter().convert(html, &note(), &[]).into_parts().0;
        assert!(md.contains("```\nraw text\n```"));
    }

    #[test]
    fn test_lists_nested() {
        let html = "<ul><li>one</li><li>two<ul><li>deep</li></ul></li></ul>";
        let md = converter().convert(html, &note(), &[]).into_parts().0;
        assert!(md.contains("- one"));
        assert!(md.contains("- two"));
        assert!(md.contains("  - deep"));
    }

    #[test]
    fn test_ordered_list_counters() {
        let html = "<ol><li>a</li><li>b</li></ol>";
        let md = converter().convert(html, &note(), &[]).into_parts().0;
        assert!(md.contains("1. a"));
        assert!(md.contains("2. b"));
    }

    #[test]
    fn test_links_are_literal() {
        let html = r#"<p><a href="https://example.com" title="Ex">go</a></p>"#;
        let md = converter().convert(html, &note(), &[]).into_parts().0;
        assert!(md.contains(r#"[go](https://example.com "Ex")"#));
    }

    #[test]
    fn test_base64_image_extracted_and_content_addressed() {
        let html = format!(r#"<p><img src="data:image/png;base64,{}" alt="dot"></p>"#, PNG_B64);
        let (md, media) = converter().convert(&html, &note(), &[]).into_parts();

        assert_eq!(media.len(), 1);
        assert!(media[0].filename.starts_with("image_"));
        assert!(media[0].filename.ends_with(".png"));
        assert!(md.contains(&format!("![dot](./assets/{})", media[0].filename)));
    }

    #[test]
    fn test_identical_images_same_filename_across_notes() {
        let html = format!(r#"<img src="data:image/png;base64,{}">"#, PNG_B64);
        let (_, media_a) = converter().convert(&html, &note(), &[]).into_parts();
        let (_, media_b) = converter().convert(&html, &note(), &[]).into_parts();
        assert_eq!(media_a[0].filename, media_b[0].filename);
    }

    #[test]
    fn test_local_resource_rewritten_to_assets() {
        let html = r#"<img src="index_files/chart.png" alt="c">"#;
        let md = converter().convert(html, &note(), &[]).into_parts().0;
        assert!(md.contains("![c](./assets/chart.png)"));
    }

    #[test]
    fn test_known_resource_name_rewritten() {
        let html = r#"<img src="weird/dir/photo.jpg">"#;
        let refs = vec!["photo.jpg".to_string()];
        let md = converter().convert(html, &note(), &refs).into_parts().0;
        assert!(md.contains("(./assets/photo.jpg)"));
    }

    #[test]
    fn test_remote_image_passes_through() {
        let html = r#"<img src="https://cdn.example.com/a.png">"#;
        let md = converter().convert(html, &note(), &[]).into_parts().0;
        assert!(md.contains("(https://cdn.example.com/a.png)"));
    }

    #[test]
    fn test_table_without_thead_gets_header() {
        let html = "<table><tr><td>Name</td><td>Age</td></tr><tr><td>Ada</td><td>36</td></tr></table>";
        let md = converter().convert(html, &note(), &[]).into_parts().0;
        assert!(md.contains("| Name | Age |"));
        assert!(md.contains("| --- | --- |"));
        assert!(md.contains("| Ada | 36 |"));
    }

    #[test]
    fn test_style_attributes_dropped() {
        let html = r#"<p style="color:red" id="x" data-foo="y">styled</p>"#;
        let md = converter().convert(html, &note(), &[]).into_parts().0;
        assert!(md.contains("styled"));
        assert!(!md.contains("color:red"));
        assert!(!md.contains("data-foo"));
    }

    #[test]
    fn test_blank_line_collapse_and_trailing_newline() {
        let html = "<p>a</p><p></p><p></p><p></p><p>b</p>";
        let md = Converter::new(true, false)
            .convert(html, &note(), &[])
            .into_parts()
            .0;
        assert!(!md.contains("\n\n\n"));
        assert!(md.ends_with("b\n"));
        assert!(!md.ends_with("\n\n"));
    }

    #[test]
    fn test_fallback_on_unrenderable_input() {
        // Nothing here survives rendering, so the converter must hand back
        // the original wrapped in a fence rather than an empty document.
        let html = "<style>p { color: red }</style>";
        let conv = converter().convert(html, &note(), &[]);
        assert!(conv.is_fallback());
        let md = conv.markdown();
        assert!(md.contains("# Test Note"));
        assert!(md.contains("```html"));
        assert!(md.contains("p { color: red }"));
    }

    #[test]
    fn test_fallback_on_pathological_nesting() {
        let mut html = String::new();
        for _ in 0..300 {
            html.push_str("<div>");
        }
        html.push('x');
        let conv = converter().convert(&html, &note(), &[]);
        assert!(conv.is_fallback());
        assert!(conv.markdown().contains("```html"));
    }

    #[test]
    fn test_fallback_never_panics_on_garbage() {
        for garbage in ["<", "<table><td", "\u{0}\u{1}", "<![CDATA[", "<a href="] {
            let conv = converter().convert(garbage, &note(), &[]);
            assert!(!conv.markdown().trim().is_empty());
        }
    }

    #[test]
    fn test_process_markdown_adds_front_matter_once() {
        let c = converter();
        let out = c.process_markdown("# Already markdown\n\nbody", &note());
        assert!(out.starts_with("---\n"));

        // A document that already opens with front-matter is left untouched
        let again = c.process_markdown(&out, &note());
        assert_eq!(again.matches("title: Test Note").count(), 1);
    }

    #[test]
    fn test_process_markdown_strips_html_tags() {
        let out = Converter::new(true, false)
            .process_markdown("text with <span>tags</span>\n\n\n\nend", &note());
        assert_eq!(out, "text with tags\n\nend\n");
    }

    #[test]
    fn test_blockquote() {
        let html = "<blockquote><p>wise words</p></blockquote>";
        let md = converter().convert(html, &note(), &[]).into_parts().0;
        assert!(md.contains("> wise words"));
    }

    #[test]
    fn test_decode_data_image_rejects_bad_uri() {
        assert!(decode_data_image("data:image/png;base64,!!!").is_none());
        assert!(decode_data_image("data:text/plain;base64,aGk=").is_none());
        assert!(decode_data_image("https://x/y.png").is_none());
    }
}
