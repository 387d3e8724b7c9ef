//! Incremental XML parsing for client streams.
//!
//! A client stream is one long-lived XML document. The parser accumulates
//! bytes, recognises the stream header and the closing tag, and cuts out
//! each complete top-level element so it can be handed to minidom.

use minidom::Element;

use crate::error::RouterError;
use crate::stanza::ns;

/// Largest top-level element accepted before the stream is rejected.
pub const MAX_ELEMENT_SIZE: usize = 512 * 1024;

/// Parsed stream header information.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamHeader {
    /// The 'to' attribute (target domain)
    pub to: Option<String>,
    /// The 'from' attribute
    pub from: Option<String>,
    /// The 'version' attribute
    pub version: Option<String>,
    /// The 'xml:lang' attribute
    pub lang: Option<String>,
}

impl StreamHeader {
    /// Parse the attributes of an opening `stream:stream` tag.
    pub fn parse(tag: &str) -> Self {
        Self {
            to: extract_attribute(tag, "to"),
            from: extract_attribute(tag, "from"),
            version: extract_attribute(tag, "version"),
            lang: extract_attribute(tag, "xml:lang"),
        }
    }
}

/// Something the parser recognised in the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Opening `stream:stream` tag
    Header(StreamHeader),
    /// A complete top-level element
    Element(Element),
    /// Closing `</stream:stream>` tag
    End,
}

/// Incremental parser for an XMPP client stream.
pub struct XmlParser {
    buffer: Vec<u8>,
    /// Next byte to scan
    pos: usize,
    /// Element nesting depth below the stream root
    depth: usize,
    /// Start of the top-level element being collected
    element_start: Option<usize>,
    header_seen: bool,
}

impl XmlParser {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(8192),
            pos: 0,
            depth: 0,
            element_start: None,
            header_seen: false,
        }
    }

    /// Feed data into the parser.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Expect a new stream header, as after SASL success. Bytes not yet
    /// consumed are kept.
    pub fn restart(&mut self) {
        self.buffer.drain(..self.element_start.unwrap_or(self.pos));
        self.pos = 0;
        self.depth = 0;
        self.element_start = None;
        self.header_seen = false;
    }

    /// Whether the stream header has been read since the last restart.
    pub fn header_seen(&self) -> bool {
        self.header_seen
    }

    /// Next complete event, or `None` if more data is needed.
    ///
    /// Errors mean the stream is not well-formed and must be closed.
    pub fn next_event(&mut self) -> Result<Option<StreamEvent>, RouterError> {
        loop {
            let Some(offset) = self.buffer[self.pos..].iter().position(|&b| b == b'<') else {
                self.check_text(self.buffer.len())?;
                self.pos = self.buffer.len();
                self.compact();
                return self.check_size().map(|_| None);
            };
            let start = self.pos + offset;
            self.check_text(start)?;

            let Some(markup) = scan_markup(&self.buffer, start)? else {
                self.pos = start;
                self.compact();
                return self.check_size().map(|_| None);
            };
            self.pos = markup.end;

            match markup.kind {
                Markup::Skip => {
                    if markup.cdata && self.depth == 0 {
                        return Err(RouterError::xml_parse("character data outside of stanza"));
                    }
                }
                Markup::Close => {
                    let name = tag_name(&self.buffer[start..markup.end], 2)?;
                    if self.depth == 0 {
                        if self.header_seen && is_stream_tag(&name) {
                            self.consume(markup.end);
                            return Ok(Some(StreamEvent::End));
                        }
                        return Err(RouterError::xml_parse(format!("unexpected </{}>", name)));
                    }
                    self.depth -= 1;
                    if self.depth == 0 {
                        let begin = self.element_start.take().unwrap_or(start);
                        let element = self.parse_element(begin, markup.end)?;
                        self.consume(markup.end);
                        return Ok(Some(StreamEvent::Element(element)));
                    }
                }
                Markup::Empty => {
                    if self.depth == 0 {
                        self.require_header()?;
                        let element = self.parse_element(start, markup.end)?;
                        self.consume(markup.end);
                        return Ok(Some(StreamEvent::Element(element)));
                    }
                }
                Markup::Open => {
                    let name = tag_name(&self.buffer[start..markup.end], 1)?;
                    if self.depth == 0 && is_stream_tag(&name) {
                        if self.header_seen {
                            return Err(RouterError::xml_parse("nested stream header"));
                        }
                        let tag = utf8(&self.buffer[start..markup.end])?;
                        let header = StreamHeader::parse(tag);
                        self.header_seen = true;
                        self.consume(markup.end);
                        return Ok(Some(StreamEvent::Header(header)));
                    }
                    if self.depth == 0 {
                        self.require_header()?;
                        self.element_start = Some(start);
                    }
                    self.depth += 1;
                }
            }
        }
    }

    fn require_header(&self) -> Result<(), RouterError> {
        if self.header_seen {
            Ok(())
        } else {
            Err(RouterError::xml_parse("element before stream header"))
        }
    }

    /// Only whitespace may appear between top-level elements.
    fn check_text(&self, end: usize) -> Result<(), RouterError> {
        if self.depth > 0 {
            return Ok(());
        }
        if self.buffer[self.pos..end].iter().all(u8::is_ascii_whitespace) {
            Ok(())
        } else {
            Err(RouterError::xml_parse("character data outside of stanza"))
        }
    }

    fn check_size(&self) -> Result<(), RouterError> {
        let pending = match self.element_start {
            Some(start) => self.buffer.len() - start,
            None => self.buffer.len(),
        };
        if pending > MAX_ELEMENT_SIZE {
            return Err(RouterError::xml_parse("element too large"));
        }
        Ok(())
    }

    fn parse_element(&self, start: usize, end: usize) -> Result<Element, RouterError> {
        let xml = with_default_namespace(utf8(&self.buffer[start..end])?);
        xml.parse::<Element>()
            .map_err(|e| RouterError::xml_parse(format!("Failed to parse element: {}", e)))
    }

    /// Drop everything up to `end`.
    fn consume(&mut self, end: usize) {
        self.buffer.drain(..end);
        self.pos = 0;
        self.element_start = None;
    }

    /// Drop bytes already scanned that belong to no pending element.
    fn compact(&mut self) {
        let keep_from = self.element_start.unwrap_or(self.pos);
        if keep_from > 0 {
            self.buffer.drain(..keep_from);
            self.pos -= keep_from;
            if let Some(start) = self.element_start.as_mut() {
                *start = 0;
            }
        }
    }
}

impl Default for XmlParser {
    fn default() -> Self {
        Self::new()
    }
}

enum Markup {
    Open,
    Close,
    Empty,
    /// Declaration, comment or CDATA section
    Skip,
}

struct ScannedMarkup {
    kind: Markup,
    end: usize,
    cdata: bool,
}

/// Scan the markup starting at `start` (a `<`). `None` means incomplete.
fn scan_markup(buf: &[u8], start: usize) -> Result<Option<ScannedMarkup>, RouterError> {
    let rest = &buf[start..];
    if rest.len() < 2 {
        return Ok(None);
    }

    let skip = |terminator: &[u8], cdata: bool| {
        find(rest, terminator).map(|i| ScannedMarkup {
            kind: Markup::Skip,
            end: start + i + terminator.len(),
            cdata,
        })
    };

    match rest[1] {
        b'?' => return Ok(skip(b"?>", false)),
        b'!' => {
            if rest.starts_with(b"<!--") {
                return Ok(skip(b"-->", false));
            }
            if rest.starts_with(b"<![CDATA[") {
                return Ok(skip(b"]]>", true));
            }
            if rest.len() < 9 && (b"<![CDATA[".starts_with(rest) || b"<!--".starts_with(rest)) {
                return Ok(None);
            }
            return Err(RouterError::xml_parse("DTDs are not allowed"));
        }
        _ => {}
    }

    let mut quote: Option<u8> = None;
    for (i, &b) in rest.iter().enumerate().skip(1) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'<' => return Err(RouterError::xml_parse("unexpected '<' inside tag")),
                b'>' => {
                    let kind = if rest[1] == b'/' {
                        Markup::Close
                    } else if rest[i - 1] == b'/' {
                        Markup::Empty
                    } else {
                        Markup::Open
                    };
                    return Ok(Some(ScannedMarkup {
                        kind,
                        end: start + i + 1,
                        cdata: false,
                    }));
                }
                _ => {}
            },
        }
    }
    Ok(None)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn utf8(bytes: &[u8]) -> Result<&str, RouterError> {
    std::str::from_utf8(bytes).map_err(|e| RouterError::xml_parse(format!("invalid UTF-8: {}", e)))
}

/// Name of the tag in `tag`, skipping the `<` or `</` prefix.
fn tag_name(tag: &[u8], prefix: usize) -> Result<String, RouterError> {
    let tag = utf8(tag)?;
    let name: String = tag[prefix..]
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != '>' && *c != '/')
        .collect();
    if name.is_empty() {
        return Err(RouterError::xml_parse("missing tag name"));
    }
    Ok(name)
}

fn is_stream_tag(name: &str) -> bool {
    name == "stream:stream" || name == "stream"
}

/// Top-level elements inherit the stream's namespaces, which minidom cannot
/// see once an element is cut out of the stream. Declare them explicitly.
fn with_default_namespace(xml: &str) -> String {
    let tag_end = xml.find('>').unwrap_or(xml.len());
    let open_tag = &xml[..tag_end];
    let name_end = open_tag
        .find(|c: char| c.is_whitespace() || c == '/')
        .unwrap_or(open_tag.len());

    let mut declarations = String::new();
    if !open_tag.contains("xmlns=") {
        declarations.push_str(&format!(" xmlns='{}'", ns::JABBER_CLIENT));
    }
    if open_tag[..name_end].starts_with("<stream:") && !open_tag.contains("xmlns:stream=") {
        declarations.push_str(&format!(" xmlns:stream='{}'", ns::STREAM));
    }
    if declarations.is_empty() {
        return xml.to_string();
    }
    format!("{}{}{}", &xml[..name_end], declarations, &xml[name_end..])
}

/// Extract an attribute value from an XML tag string.
fn extract_attribute(tag: &str, name: &str) -> Option<String> {
    for quote in ['"', '\''] {
        let pattern = format!(" {}={}", name, quote);
        if let Some(start) = tag.find(&pattern) {
            let value_start = start + pattern.len();
            if let Some(value_end) = tag[value_start..].find(quote) {
                return Some(tag[value_start..value_start + value_end].to_string());
            }
        }
    }
    None
}
