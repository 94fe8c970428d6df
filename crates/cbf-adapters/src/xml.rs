//! Record splitting and a small element tree for vendor XML.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

/// One raw record element cut out of a feed document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRecord<'a> {
    pub index: usize,
    pub fragment: &'a str,
}

/// Cuts `doc` into record fragments (`<property>…</property>` and the like)
/// in document order, without parsing the whole document.
///
/// Comments, CDATA sections, processing instructions and doctype
/// declarations are skipped, so markup inside them never opens or closes a
/// record. Records never nest: a record start seen while another record is
/// open ends the open one there, and an unterminated trailing record runs to
/// the end of the document. Both are handed on as fragments so that the
/// parser reports them as skipped instead of losing their neighbours.
pub fn split_records<'a>(doc: &'a str, record_tags: &[&str]) -> Vec<RawRecord<'a>> {
    let bytes = doc.as_bytes();
    let mut records = Vec::new();
    let mut open: Option<(usize, &str)> = None;
    let mut pos = 0;

    let push = |start: usize, end: usize, records: &mut Vec<RawRecord<'a>>| {
        let index = records.len();
        records.push(RawRecord {
            index,
            fragment: &doc[start..end],
        });
    };

    while let Some(offset) = doc[pos..].find('<') {
        let lt = pos + offset;
        let rest = &doc[lt..];

        if rest.starts_with("<!--") {
            pos = skip_past(doc, lt, "-->");
            continue;
        }
        if rest.starts_with("<![CDATA[") {
            pos = skip_past(doc, lt, "]]>");
            continue;
        }
        if rest.starts_with("<?") {
            pos = skip_past(doc, lt, "?>");
            continue;
        }
        if rest.starts_with("<!") {
            pos = skip_past(doc, lt, ">");
            continue;
        }

        let closing = rest.starts_with("</");
        let name_start = if closing { lt + 2 } else { lt + 1 };
        let name_end = doc[name_start..]
            .find(|c: char| c.is_whitespace() || c == '/' || c == '>')
            .map(|i| name_start + i)
            .unwrap_or(doc.len());
        let name = &doc[name_start..name_end];
        let tag_end = skip_past(doc, name_end, ">");
        let self_closing = !closing && tag_end >= 2 && bytes[tag_end - 2] == b'/';

        match open {
            Some((start, open_name)) if closing && name.eq_ignore_ascii_case(open_name) => {
                push(start, tag_end, &mut records);
                open = None;
            }
            Some((start, _)) if !closing && is_record_tag(record_tags, name) => {
                push(start, lt, &mut records);
                if self_closing {
                    push(lt, tag_end, &mut records);
                    open = None;
                } else {
                    open = Some((lt, name));
                }
            }
            None if !closing && is_record_tag(record_tags, name) => {
                if self_closing {
                    push(lt, tag_end, &mut records);
                } else {
                    open = Some((lt, name));
                }
            }
            _ => {}
        }

        pos = tag_end;
    }

    if let Some((start, _)) = open {
        push(start, doc.len(), &mut records);
    }

    records
}

fn is_record_tag(record_tags: &[&str], name: &str) -> bool {
    record_tags.iter().any(|tag| tag.eq_ignore_ascii_case(name))
}

fn skip_past(doc: &str, from: usize, terminator: &str) -> usize {
    doc[from..]
        .find(terminator)
        .map(|i| from + i + terminator.len())
        .unwrap_or(doc.len())
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FragmentError {
    #[error("xml syntax error at byte {position}: {message}")]
    Syntax { position: u64, message: String },
    #[error("unclosed element <{0}>")]
    Unclosed(String),
    #[error("more than one root element")]
    MultipleRoots,
    #[error("fragment contains no element")]
    Empty,
}

/// Element tree node. Text and CDATA content are concatenated into `text`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XmlNode {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    pub fn parse_fragment(fragment: &str) -> Result<Self, FragmentError> {
        let mut reader = Reader::from_str(fragment);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<XmlNode> = Vec::new();
        let mut root: Option<XmlNode> = None;

        loop {
            let event = reader.read_event().map_err(|err| FragmentError::Syntax {
                position: reader.buffer_position() as u64,
                message: err.to_string(),
            })?;
            match event {
                Event::Start(start) => stack.push(node_from_start(&start)?),
                Event::Empty(start) => {
                    let node = node_from_start(&start)?;
                    attach(&mut stack, &mut root, node)?;
                }
                Event::End(_) => {
                    let Some(node) = stack.pop() else {
                        return Err(FragmentError::Syntax {
                            position: reader.buffer_position() as u64,
                            message: "end tag without start".to_string(),
                        });
                    };
                    attach(&mut stack, &mut root, node)?;
                }
                Event::Text(text) => {
                    if let Some(top) = stack.last_mut() {
                        let decoded = text
                            .unescape()
                            .map(|c| c.into_owned())
                            .unwrap_or_else(|_| String::from_utf8_lossy(&text).into_owned());
                        top.text.push_str(&decoded);
                    }
                }
                Event::CData(cdata) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&String::from_utf8_lossy(&cdata.into_inner()));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if let Some(unclosed) = stack.pop() {
            return Err(FragmentError::Unclosed(unclosed.name));
        }
        root.ok_or(FragmentError::Empty)
    }

    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children
            .iter()
            .filter(move |c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> &str {
        self.text.trim()
    }

    /// Follows a path of child names from this node.
    pub fn at_path(&self, path: &[&str]) -> Option<&XmlNode> {
        path.iter().try_fold(self, |node, segment| node.child(segment))
    }
}

fn node_from_start(start: &BytesStart<'_>) -> Result<XmlNode, FragmentError> {
    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|err| FragmentError::Syntax {
            position: 0,
            message: format!("bad attribute on <{name}>: {err}"),
        })?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned());
        attrs.push((key, value));
    }
    Ok(XmlNode {
        name,
        attrs,
        ..XmlNode::default()
    })
}

fn attach(
    stack: &mut [XmlNode],
    root: &mut Option<XmlNode>,
    node: XmlNode,
) -> Result<(), FragmentError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
        return Ok(());
    }
    if root.is_some() {
        return Err(FragmentError::MultipleRoots);
    }
    *root = Some(node);
    Ok(())
}
