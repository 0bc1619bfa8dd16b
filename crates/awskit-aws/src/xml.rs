//! Small element tree over `quick-xml` for AWS XML responses.
//!
//! AWS responses are small and only read once, so they are parsed into an
//! owned tree and queried by local element name. Namespace prefixes are
//! dropped.

use awskit_core::ProviderError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::Value;

/// One XML element with its accumulated text and child elements.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlNode {
    pub name: String,
    pub text: String,
    pub children: Vec<XmlNode>,
}

fn malformed(err: impl std::fmt::Display) -> ProviderError {
    ProviderError::new("MalformedResponse", &format!("invalid XML response: {}", err))
}

impl XmlNode {
    fn named(start: &BytesStart<'_>) -> Self {
        Self {
            name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
            ..Self::default()
        }
    }

    /// Parse a document and return its root element.
    pub fn parse(xml: &str) -> Result<XmlNode, ProviderError> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        // Bottom of the stack is a synthetic document node.
        let mut stack: Vec<XmlNode> = vec![XmlNode::default()];
        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => stack.push(XmlNode::named(&start)),
                Ok(Event::Empty(start)) => {
                    let node = XmlNode::named(&start);
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(node);
                    }
                }
                Ok(Event::End(_)) => {
                    if stack.len() < 2 {
                        return Err(malformed("unbalanced closing tag"));
                    }
                    if let Some(node) = stack.pop() {
                        if let Some(parent) = stack.last_mut() {
                            parent.children.push(node);
                        }
                    }
                }
                Ok(Event::Text(text)) => {
                    let text = text.unescape().map_err(malformed)?;
                    if let Some(node) = stack.last_mut() {
                        node.text.push_str(&text);
                    }
                }
                Ok(Event::CData(data)) => {
                    let data = data.into_inner();
                    if let Some(node) = stack.last_mut() {
                        node.text.push_str(&String::from_utf8_lossy(&data));
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(err) => return Err(malformed(err)),
            }
        }

        if stack.len() != 1 {
            return Err(malformed("unclosed element"));
        }
        stack
            .pop()
            .and_then(|document| document.children.into_iter().next())
            .ok_or_else(|| malformed("empty document"))
    }

    /// First direct child named `name`.
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All direct children named `name`.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Follow a chain of direct children.
    pub fn path(&self, path: &[&str]) -> Option<&XmlNode> {
        path.iter().try_fold(self, |node, name| node.child(name))
    }

    /// First descendant named `name`, depth first.
    pub fn find(&self, name: &str) -> Option<&XmlNode> {
        for child in &self.children {
            if child.name == name {
                return Some(child);
            }
            if let Some(found) = child.find(name) {
                return Some(found);
            }
        }
        None
    }

    /// The `<{Action}Result>` wrapper of a Query response, or the root itself.
    pub fn result(&self, action: &str) -> &XmlNode {
        let wrapper = format!("{}Result", action);
        self.child(&wrapper).unwrap_or(self)
    }

    /// Entries of a list wrapper, e.g. `<instancesSet><item/>...</instancesSet>`.
    pub fn list<'a>(&'a self, wrapper: &str, entry: &'a str) -> Vec<&'a XmlNode> {
        match self.child(wrapper) {
            Some(list) => list.children_named(entry).collect(),
            None => Vec::new(),
        }
    }

    /// Text of the direct child `name`, if present and non-empty.
    pub fn text_of(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str()).filter(|t| !t.is_empty())
    }

    /// Text of the first descendant `name`, if present and non-empty.
    pub fn find_text(&self, name: &str) -> Option<&str> {
        self.find(name).map(|c| c.text.as_str()).filter(|t| !t.is_empty())
    }

    pub fn string(&self, name: &str) -> Value {
        self.text_of(name).map_or(Value::Null, |t| Value::String(t.to_string()))
    }

    pub fn int(&self, name: &str) -> Value {
        self.text_of(name)
            .and_then(|t| t.trim().parse::<i64>().ok())
            .map_or(Value::Null, Value::from)
    }

    pub fn float(&self, name: &str) -> Value {
        self.text_of(name)
            .and_then(|t| t.trim().parse::<f64>().ok())
            .map_or(Value::Null, Value::from)
    }

    pub fn boolean(&self, name: &str) -> Value {
        match self.text_of(name) {
            Some("true") => Value::Bool(true),
            Some("false") => Value::Bool(false),
            _ => Value::Null,
        }
    }
}
