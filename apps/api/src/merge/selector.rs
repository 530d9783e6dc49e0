//! Minimal element locator for generated CV markup.
//!
//! Supports one compound selector (`tag`, `#id`, `.class`, `[attr]`,
//! `[attr=value]`, or any combination such as `section.skills[data-part="x"]`).
//! Combinators are rejected. The scanner tolerates comments, doctypes, void
//! elements and raw-text `script`/`style` bodies; an element whose end tag
//! cannot be found is reported as malformed.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("selector is empty")]
    Empty,
    #[error("unsupported selector syntax '{0}' (combinators and lists are not supported)")]
    Unsupported(String),
    #[error("malformed selector '{0}'")]
    Malformed(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MarkupError {
    #[error("unterminated {0} starting at byte {1}")]
    Unterminated(&'static str, usize),
    #[error("element <{0}> opened at byte {1} is never closed")]
    Unclosed(String, usize),
}

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

// ────────────────────────────────────────────────────────────────────────────
// Selector
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<(String, Option<String>)>,
}

impl Selector {
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(SelectorError::Empty);
        }

        let bytes = input.as_bytes();
        let mut selector = Selector::default();
        let mut pos = 0;

        if bytes[0] == b'*' {
            pos = 1;
        } else if is_ident_byte(bytes[0]) {
            let end = ident_end(bytes, 0);
            selector.tag = Some(input[..end].to_ascii_lowercase());
            pos = end;
        }

        while pos < bytes.len() {
            match bytes[pos] {
                b'#' => {
                    let end = ident_end(bytes, pos + 1);
                    if end == pos + 1 || selector.id.is_some() {
                        return Err(SelectorError::Malformed(input.to_string()));
                    }
                    selector.id = Some(input[pos + 1..end].to_string());
                    pos = end;
                }
                b'.' => {
                    let end = ident_end(bytes, pos + 1);
                    if end == pos + 1 {
                        return Err(SelectorError::Malformed(input.to_string()));
                    }
                    selector.classes.push(input[pos + 1..end].to_string());
                    pos = end;
                }
                b'[' => {
                    let close = find_attr_close(bytes, pos + 1)
                        .ok_or_else(|| SelectorError::Malformed(input.to_string()))?;
                    let attr = parse_attr_selector(&input[pos + 1..close])
                        .ok_or_else(|| SelectorError::Malformed(input.to_string()))?;
                    selector.attrs.push(attr);
                    pos = close + 1;
                }
                b' ' | b'\t' | b'\n' | b'>' | b'+' | b'~' | b',' | b':' => {
                    return Err(SelectorError::Unsupported(input.to_string()));
                }
                _ => return Err(SelectorError::Malformed(input.to_string())),
            }
        }

        Ok(selector)
    }

    fn matches(&self, tag: &StartTag<'_>) -> bool {
        if let Some(name) = &self.tag {
            if *name != tag.name {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if tag.attr("id") != Some(id.as_str()) {
                return false;
            }
        }
        if !self.classes.is_empty() {
            let class_attr = tag.attr("class").unwrap_or("");
            let present: Vec<&str> = class_attr.split_ascii_whitespace().collect();
            if !self.classes.iter().all(|c| present.contains(&c.as_str())) {
                return false;
            }
        }
        self.attrs.iter().all(|(name, expected)| match expected {
            Some(value) => tag.attr(name) == Some(value.as_str()),
            None => tag.has_attr(name),
        })
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

fn ident_end(bytes: &[u8], from: usize) -> usize {
    let mut end = from;
    while end < bytes.len() && is_ident_byte(bytes[end]) {
        end += 1;
    }
    end
}

fn find_attr_close(bytes: &[u8], from: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, &b) in bytes.iter().enumerate().skip(from) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b']' => return Some(i),
            None => {}
        }
    }
    None
}

fn parse_attr_selector(inner: &str) -> Option<(String, Option<String>)> {
    let inner = inner.trim();
    match inner.split_once('=') {
        None => {
            let bytes = inner.as_bytes();
            (!inner.is_empty() && ident_end(bytes, 0) == bytes.len())
                .then(|| (inner.to_ascii_lowercase(), None))
        }
        Some((name, value)) => {
            let name = name.trim();
            let bytes = name.as_bytes();
            if name.is_empty() || ident_end(bytes, 0) != bytes.len() {
                return None;
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            Some((name.to_ascii_lowercase(), Some(value.to_string())))
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Markup scanning
// ────────────────────────────────────────────────────────────────────────────

/// Byte offsets of a located element.
///
/// `start..open_end` is the start tag, `open_end..close_start` the inner content,
/// `close_start..end` the end tag. Void and self-closing elements have
/// `open_end == close_start == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementSpan {
    pub start: usize,
    pub open_end: usize,
    pub close_start: usize,
    pub end: usize,
}

impl ElementSpan {
    pub fn is_void(&self) -> bool {
        self.open_end == self.end
    }
}

#[derive(Debug)]
struct StartTag<'a> {
    name: String,
    attrs: Vec<(String, Option<&'a str>)>,
    start: usize,
    end: usize,
    self_closing: bool,
}

impl StartTag<'_> {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| *v)
    }

    fn has_attr(&self, name: &str) -> bool {
        self.attrs.iter().any(|(n, _)| n == name)
    }

    fn is_void(&self) -> bool {
        self.self_closing || VOID_ELEMENTS.contains(&self.name.as_str())
    }
}

#[derive(Debug)]
enum Token<'a> {
    Start(StartTag<'a>),
    End { name: String, start: usize, end: usize },
}

/// Returns the next start or end tag at or after `from`, skipping comments,
/// doctypes, processing instructions and stray `<` characters.
fn next_token(html: &str, from: usize) -> Result<Option<Token<'_>>, MarkupError> {
    let bytes = html.as_bytes();
    let mut pos = from;

    while pos < bytes.len() {
        let Some(offset) = html[pos..].find('<') else {
            return Ok(None);
        };
        let lt = pos + offset;
        let rest = &html[lt..];

        if rest.starts_with("<!--") {
            let close = rest
                .find("-->")
                .ok_or(MarkupError::Unterminated("comment", lt))?;
            pos = lt + close + 3;
        } else if rest.starts_with("<!") || rest.starts_with("<?") {
            let close = rest
                .find('>')
                .ok_or(MarkupError::Unterminated("declaration", lt))?;
            pos = lt + close + 1;
        } else if let Some(after) = rest.strip_prefix("</") {
            let close = after
                .find('>')
                .ok_or(MarkupError::Unterminated("end tag", lt))?;
            let name = after[..close].trim().to_ascii_lowercase();
            return Ok(Some(Token::End {
                name,
                start: lt,
                end: lt + 2 + close + 1,
            }));
        } else if bytes.get(lt + 1).is_some_and(|b| b.is_ascii_alphabetic()) {
            return parse_start_tag(html, lt).map(|tag| Some(Token::Start(tag)));
        } else {
            pos = lt + 1;
        }
    }

    Ok(None)
}

fn parse_start_tag(html: &str, lt: usize) -> Result<StartTag<'_>, MarkupError> {
    let bytes = html.as_bytes();
    let name_end = ident_end(bytes, lt + 1);
    let name = html[lt + 1..name_end].to_ascii_lowercase();

    let mut attrs = Vec::new();
    let mut pos = name_end;
    let mut self_closing = false;

    loop {
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        match bytes.get(pos) {
            None => return Err(MarkupError::Unterminated("start tag", lt)),
            Some(b'>') => {
                pos += 1;
                break;
            }
            Some(b'/') if bytes.get(pos + 1) == Some(&b'>') => {
                self_closing = true;
                pos += 2;
                break;
            }
            Some(b'/') => pos += 1,
            Some(_) => {
                let attr_start = pos;
                while pos < bytes.len()
                    && !bytes[pos].is_ascii_whitespace()
                    && !matches!(bytes[pos], b'=' | b'>' | b'/')
                {
                    pos += 1;
                }
                let attr_name = html[attr_start..pos].to_ascii_lowercase();

                while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                    pos += 1;
                }
                let mut value = None;
                if bytes.get(pos) == Some(&b'=') {
                    pos += 1;
                    while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                        pos += 1;
                    }
                    match bytes.get(pos) {
                        Some(&q) if q == b'"' || q == b'\'' => {
                            let close = html[pos + 1..]
                                .find(q as char)
                                .ok_or(MarkupError::Unterminated("attribute value", pos))?;
                            value = Some(&html[pos + 1..pos + 1 + close]);
                            pos += close + 2;
                        }
                        _ => {
                            let value_start = pos;
                            while pos < bytes.len()
                                && !bytes[pos].is_ascii_whitespace()
                                && bytes[pos] != b'>'
                            {
                                pos += 1;
                            }
                            value = Some(&html[value_start..pos]);
                        }
                    }
                }
                attrs.push((attr_name, value));
            }
        }
    }

    Ok(StartTag {
        name,
        attrs,
        start: lt,
        end: pos,
        self_closing,
    })
}

/// Finds the end tag balancing `tag`, counting nested elements of the same name.
fn close_of(html: &str, tag: &StartTag<'_>) -> Result<(usize, usize), MarkupError> {
    if RAW_TEXT_ELEMENTS.contains(&tag.name.as_str()) {
        let needle = format!("</{}", tag.name);
        let lower = html[tag.end..].to_ascii_lowercase();
        let offset = lower
            .find(&needle)
            .ok_or_else(|| MarkupError::Unclosed(tag.name.clone(), tag.start))?;
        let close_start = tag.end + offset;
        let gt = html[close_start..]
            .find('>')
            .ok_or(MarkupError::Unterminated("end tag", close_start))?;
        return Ok((close_start, close_start + gt + 1));
    }

    let mut depth = 1usize;
    let mut pos = tag.end;
    while let Some(token) = next_token(html, pos)? {
        match token {
            Token::Start(inner) => {
                pos = inner.end;
                if RAW_TEXT_ELEMENTS.contains(&inner.name.as_str()) {
                    pos = close_of(html, &inner)?.1;
                } else if inner.name == tag.name && !inner.is_void() {
                    depth += 1;
                }
            }
            Token::End { name, start, end } => {
                pos = end;
                if name == tag.name {
                    depth -= 1;
                    if depth == 0 {
                        return Ok((start, end));
                    }
                }
            }
        }
    }

    Err(MarkupError::Unclosed(tag.name.clone(), tag.start))
}

/// Every element matching `selector`, in document order.
pub fn find_all(html: &str, selector: &Selector) -> Result<Vec<ElementSpan>, MarkupError> {
    let mut spans = Vec::new();
    let mut pos = 0;

    while let Some(token) = next_token(html, pos)? {
        match token {
            Token::Start(tag) => {
                pos = tag.end;
                let is_raw = RAW_TEXT_ELEMENTS.contains(&tag.name.as_str());

                if selector.matches(&tag) {
                    let span = if tag.is_void() {
                        ElementSpan {
                            start: tag.start,
                            open_end: tag.end,
                            close_start: tag.end,
                            end: tag.end,
                        }
                    } else {
                        let (close_start, end) = close_of(html, &tag)?;
                        ElementSpan {
                            start: tag.start,
                            open_end: tag.end,
                            close_start,
                            end,
                        }
                    };
                    spans.push(span);
                }

                if is_raw {
                    pos = close_of(html, &tag)?.1;
                }
            }
            Token::End { end, .. } => pos = end,
        }
    }

    Ok(spans)
}
