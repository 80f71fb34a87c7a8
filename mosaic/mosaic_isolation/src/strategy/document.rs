//! Defensive document parser.
//!
//! Sub-application markup is turned into [`ContentNode`] values instead of
//! being handed to the host as raw text. While building nodes the parser
//! drops inline event handler attributes, `javascript:` URLs and document
//! metadata (`<meta>`, `<base>`). Scripts are pulled out of the tree so the
//! caller decides how and where they run.

use mosaic_core::types::{ContentNode, ScriptSource};
use url::Url;

/// Elements dropped together with their attributes.
const DROPPED_ELEMENTS: &[&str] = &["meta", "base"];

/// Document wrappers whose children are hoisted.
const TRANSPARENT_ELEMENTS: &[&str] = &["html", "head", "body"];

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

/// Attributes holding a URL.
const URL_ATTRIBUTES: &[&str] = &[
    "href",
    "src",
    "action",
    "formaction",
    "xlink:href",
    "poster",
    "data",
    "background",
];

/// A script found in a document, in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptEntry {
    /// Where the code comes from.
    pub source: ScriptSource,

    /// Whether the script is an ES module.
    pub module: bool,
}

/// Result of parsing a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedDocument {
    /// Document title, if any.
    pub title: Option<String>,

    /// Sanitized content nodes.
    pub nodes: Vec<ContentNode>,

    /// Scripts to run after the nodes are attached.
    pub scripts: Vec<ScriptEntry>,
}

/// Parse `html`, resolving relative script URLs against `base`.
pub fn parse_document(html: &str, base: &Url) -> ParsedDocument {
    let mut builder = TreeBuilder::default();
    let mut tokenizer = Tokenizer::new(html);

    while let Some(token) = tokenizer.next_token() {
        match token {
            Token::Text(text) => builder.text(&text),
            Token::EndTag(name) => builder.close(&name),
            Token::StartTag {
                name,
                attributes,
                self_closing,
            } => match name.as_str() {
                "script" => {
                    let code = tokenizer.raw_text("script");
                    if let Some(entry) = script_entry(&attributes, code, base) {
                        builder.document.scripts.push(entry);
                    }
                }
                "style" => {
                    let css = tokenizer.raw_text("style");
                    builder.append(ContentNode::Style(css));
                }
                "title" => {
                    let title = decode_entities(tokenizer.raw_text("title").trim());
                    builder.document.title = Some(title);
                }
                name if DROPPED_ELEMENTS.contains(&name) => {}
                name if TRANSPARENT_ELEMENTS.contains(&name) => {}
                _ => {
                    let attributes = sanitize_attributes(attributes);
                    if self_closing || VOID_ELEMENTS.contains(&name.as_str()) {
                        builder.append(ContentNode::Element {
                            tag: name,
                            attributes,
                            children: Vec::new(),
                        });
                    } else {
                        builder.open(name, attributes);
                    }
                }
            },
        }
    }

    builder.finish()
}

fn script_entry(attributes: &[(String, String)], code: String, base: &Url) -> Option<ScriptEntry> {
    let attribute = |key: &str| {
        attributes
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    };

    let module = attribute("type").map(|t| t.trim().eq_ignore_ascii_case("module")) == Some(true);

    let source = match attribute("src") {
        Some(src) if is_script_url(src) => return None,
        Some(src) => ScriptSource::External(base.join(src.trim()).ok()?),
        None if code.trim().is_empty() => return None,
        None => ScriptSource::Inline(code),
    };

    Some(ScriptEntry { source, module })
}

fn sanitize_attributes(attributes: Vec<(String, String)>) -> Vec<(String, String)> {
    attributes
        .into_iter()
        .filter(|(name, value)| {
            if name.starts_with("on") || name == "srcdoc" {
                return false;
            }
            !(URL_ATTRIBUTES.contains(&name.as_str()) && is_script_url(value))
        })
        .collect()
}

/// Whether a URL would execute script when followed.
///
/// `data:` URLs count unless they carry a raster image; markup and SVG
/// payloads run script once loaded.
pub fn is_script_url(value: &str) -> bool {
    let normalized: String = value
        .chars()
        .filter(|c| !c.is_ascii_whitespace() && !c.is_control())
        .collect::<String>()
        .to_ascii_lowercase();
    if normalized.starts_with("javascript:") || normalized.starts_with("vbscript:") {
        return true;
    }
    match normalized.strip_prefix("data:") {
        Some(payload) => {
            let media_type = payload.split([';', ',']).next().unwrap_or_default();
            !media_type.starts_with("image/") || media_type == "image/svg+xml"
        }
        None => false,
    }
}

/// Decode the character references that matter for text content.
pub fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        rest = &rest[start..];

        let decoded = rest.find(';').filter(|end| *end <= 10).and_then(|end| {
            let entity = &rest[1..end];
            let c = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            };
            c.map(|c| (c, end))
        });

        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[derive(Debug)]
enum Token {
    Text(String),
    StartTag {
        name: String,
        attributes: Vec<(String, String)>,
        self_closing: bool,
    },
    EndTag(String),
}

struct Tokenizer<'a> {
    src: &'a str,
    lower: String,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            lower: src.to_ascii_lowercase(),
            pos: 0,
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn next_token(&mut self) -> Option<Token> {
        loop {
            let rest = self.rest();
            if rest.is_empty() {
                return None;
            }

            if !rest.starts_with('<') {
                let end = rest.find('<').unwrap_or(rest.len());
                self.pos += end;
                return Some(Token::Text(rest[..end].to_string()));
            }

            if rest.starts_with("<!--") {
                self.skip_past("-->", 4);
                continue;
            }

            if rest.starts_with("<!") || rest.starts_with("<?") {
                self.skip_past(">", 2);
                continue;
            }

            if let Some(after) = rest.strip_prefix("</") {
                if after.starts_with(|c: char| c.is_ascii_alphabetic()) {
                    let end = after.find('>').unwrap_or(after.len());
                    let name = after[..end]
                        .split(|c: char| c.is_ascii_whitespace())
                        .next()
                        .unwrap_or("")
                        .to_ascii_lowercase();
                    self.pos += 2 + (end + 1).min(after.len());
                    return Some(Token::EndTag(name));
                }
            }

            if rest[1..].starts_with(|c: char| c.is_ascii_alphabetic()) {
                return Some(self.start_tag());
            }

            // A lone '<' is text.
            self.pos += 1;
            return Some(Token::Text("<".to_string()));
        }
    }

    fn skip_past(&mut self, terminator: &str, from: usize) {
        let rest = self.rest();
        match rest[from..].find(terminator) {
            Some(index) => self.pos += from + index + terminator.len(),
            None => self.pos = self.src.len(),
        }
    }

    fn start_tag(&mut self) -> Token {
        // Skip '<'.
        self.pos += 1;
        let name = self.take_while(|c| !c.is_ascii_whitespace() && c != '>' && c != '/');
        let name = name.to_ascii_lowercase();

        let mut attributes: Vec<(String, String)> = Vec::new();
        let mut self_closing = false;

        loop {
            self.take_while(|c| c.is_ascii_whitespace());
            let rest = self.rest();
            if rest.is_empty() {
                break;
            }
            if rest.starts_with('>') {
                self.pos += 1;
                break;
            }
            if rest.starts_with("/>") {
                self.pos += 2;
                self_closing = true;
                break;
            }
            if rest.starts_with('/') {
                self.pos += 1;
                continue;
            }

            let key = self
                .take_while(|c| !c.is_ascii_whitespace() && c != '=' && c != '>' && c != '/')
                .to_ascii_lowercase();
            if key.is_empty() {
                // Stray character; skip it so we always make progress.
                let step = self.rest().chars().next().map_or(1, char::len_utf8);
                self.pos += step;
                continue;
            }

            self.take_while(|c| c.is_ascii_whitespace());
            let value = if self.rest().starts_with('=') {
                self.pos += 1;
                self.take_while(|c| c.is_ascii_whitespace());
                self.attribute_value()
            } else {
                String::new()
            };

            // First occurrence wins.
            if !attributes.iter().any(|(existing, _)| *existing == key) {
                attributes.push((key, value));
            }
        }

        Token::StartTag {
            name,
            attributes,
            self_closing,
        }
    }

    fn attribute_value(&mut self) -> String {
        let rest = self.rest();
        match rest.chars().next() {
            Some(quote @ ('"' | '\'')) => {
                let body = &rest[1..];
                let end = body.find(quote).unwrap_or(body.len());
                self.pos += 1 + (end + 1).min(body.len());
                decode_entities(&body[..end])
            }
            _ => decode_entities(self.take_while(|c| !c.is_ascii_whitespace() && c != '>')),
        }
    }

    fn take_while(&mut self, predicate: impl Fn(char) -> bool) -> &'a str {
        let rest = self.rest();
        let end = rest
            .char_indices()
            .find(|(_, c)| !predicate(*c))
            .map_or(rest.len(), |(index, _)| index);
        self.pos += end;
        &rest[..end]
    }

    /// Consume everything up to and including `</tag>`, returning the body.
    fn raw_text(&mut self, tag: &str) -> String {
        let close = format!("</{}", tag);
        let start = self.pos;
        match self.lower[start..].find(&close) {
            Some(offset) => {
                let body = self.src[start..start + offset].to_string();
                let after = start + offset;
                self.pos = match self.src[after..].find('>') {
                    Some(end) => after + end + 1,
                    None => self.src.len(),
                };
                body
            }
            None => {
                self.pos = self.src.len();
                self.src[start..].to_string()
            }
        }
    }
}

#[derive(Default)]
struct TreeBuilder {
    document: ParsedDocument,
    open: Vec<(String, Vec<(String, String)>, Vec<ContentNode>)>,
}

impl TreeBuilder {
    fn append(&mut self, node: ContentNode) {
        match self.open.last_mut() {
            Some((_, _, children)) => children.push(node),
            None => self.document.nodes.push(node),
        }
    }

    fn text(&mut self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        self.append(ContentNode::Text(decode_entities(text)));
    }

    fn open(&mut self, tag: String, attributes: Vec<(String, String)>) {
        self.open.push((tag, attributes, Vec::new()));
    }

    fn close(&mut self, tag: &str) {
        if !self.open.iter().any(|(open, _, _)| open == tag) {
            return;
        }
        while let Some((open, attributes, children)) = self.open.pop() {
            let matched = open == tag;
            self.append(ContentNode::Element {
                tag: open,
                attributes,
                children,
            });
            if matched {
                break;
            }
        }
    }

    fn finish(mut self) -> ParsedDocument {
        while let Some((tag, attributes, children)) = self.open.pop() {
            self.append(ContentNode::Element {
                tag,
                attributes,
                children,
            });
        }
        self.document
    }
}
