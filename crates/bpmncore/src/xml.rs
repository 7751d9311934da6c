//! Minimal XML tree and the XPath subset used by XML data operations.
//!
//! Supported location paths: absolute `/a/b` and descendant `//b` steps, name
//! tests or `*`, predicates `[n]`, `[@attr]`, `[@attr='v']` and `[child='v']`,
//! and a final `@attr` or `text()` step.

use quick_xml::escape::{escape, partial_escape};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum XmlError {
    #[error("Malformed XML: {0}")]
    Parse(String),

    #[error("Invalid XPath '{xpath}': {reason}")]
    InvalidXPath { xpath: String, reason: String },
}

/// Markup bodies are kept raw, without their delimiters, so they render back
/// as they were read.
#[derive(Debug, Clone, PartialEq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
    CData(String),
    Comment(String),
    /// `<?xml ...?>`
    Declaration(String),
    ProcessingInstruction(String),
    DocType(String),
}

impl XmlNode {
    fn write_to(&self, out: &mut String) {
        let (open, body, close) = match self {
            XmlNode::Element(element) => return element.write_to(out),
            XmlNode::Text(text) => return out.push_str(&partial_escape(text.as_str())),
            XmlNode::CData(text) => ("<![CDATA[", text, "]]>"),
            XmlNode::Comment(text) => ("<!--", text, "-->"),
            XmlNode::Declaration(text) | XmlNode::ProcessingInstruction(text) => ("<?", text, "?>"),
            XmlNode::DocType(text) => ("<!DOCTYPE ", text, ">"),
        };
        out.push_str(open);
        out.push_str(body);
        out.push_str(close);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
    /// Renders as `<name/>` when it has no children
    pub self_closing: bool,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
            self_closing: true,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn set_attribute(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(key, _)| key == name) {
            Some((_, existing)) => *existing = value,
            None => self.attributes.push((name.to_string(), value)),
        }
    }

    /// Concatenated text of this element and its descendants
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        for child in &self.children {
            match child {
                XmlNode::Text(text) | XmlNode::CData(text) => out.push_str(text),
                XmlNode::Element(element) => element.collect_text(out),
                _ => {}
            }
        }
    }

    /// Replaces every child with a single text node
    pub fn set_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.children.clear();
        if !text.is_empty() {
            self.children.push(XmlNode::Text(text));
        }
    }

    fn child_elements(&self) -> impl Iterator<Item = (usize, &XmlElement)> {
        self.children.iter().enumerate().filter_map(|(i, child)| match child {
            XmlNode::Element(element) => Some((i, element)),
            _ => None,
        })
    }

    fn write_to(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attributes {
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(&escape(value.as_str()));
            out.push('"');
        }
        if self.children.is_empty() && self.self_closing {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            child.write_to(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

impl fmt::Display for XmlElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.write_to(&mut out);
        write!(f, "{}", out)
    }
}

/// Parsed XML data value
#[derive(Debug, Clone, PartialEq)]
pub struct XmlDocument {
    /// Declaration, doctype, comments and whitespace ahead of the root
    pub prolog: Vec<XmlNode>,
    pub root: XmlElement,
    pub epilog: Vec<XmlNode>,
}

/// What an update writes at each matched location
#[derive(Debug, Clone, PartialEq)]
pub enum XmlReplacement {
    Text(String),
    Element(XmlElement),
}

impl XmlDocument {
    /// Whitespace, comments and processing instructions are kept in the tree,
    /// so a document renders back as it was read.
    pub fn parse(input: &str) -> Result<Self, XmlError> {
        let mut reader = Reader::from_str(input);
        let mut tree = TreeBuilder::default();

        loop {
            match reader.read_event().map_err(|e| XmlError::Parse(e.to_string()))? {
                Event::Start(start) => tree.stack.push(element_from(&start, false)?),
                Event::Empty(start) => tree.push(XmlNode::Element(element_from(&start, true)?))?,
                Event::End(_) => {
                    let element = tree
                        .stack
                        .pop()
                        .ok_or_else(|| XmlError::Parse("unexpected closing tag".to_string()))?;
                    tree.push(XmlNode::Element(element))?;
                }
                Event::Text(text) => {
                    let text = text
                        .unescape()
                        .map_err(|e| XmlError::Parse(e.to_string()))?
                        .into_owned();
                    tree.push(XmlNode::Text(text))?;
                }
                Event::CData(data) => tree.push(XmlNode::CData(lossy(&data.into_inner())))?,
                Event::Comment(text) => tree.push(XmlNode::Comment(lossy(&text)))?,
                Event::Decl(decl) => tree.push(XmlNode::Declaration(lossy(&decl)))?,
                Event::PI(pi) => tree.push(XmlNode::ProcessingInstruction(lossy(&pi)))?,
                Event::DocType(text) => tree.push(XmlNode::DocType(lossy(&text)))?,
                Event::Eof => break,
            }
        }
        tree.finish()
    }

    /// Values at every location the XPath selects, in document order
    pub fn read(&self, xpath: &str) -> Result<Vec<String>, XmlError> {
        let path = XPath::parse(xpath)?;
        let mut values = Vec::new();
        for location in path.select(&self.root) {
            let Some(element) = self.element(&location) else {
                continue;
            };
            match &path.target {
                Target::Element | Target::Text => values.push(element.text()),
                Target::Attribute(name) => {
                    if let Some(value) = element.attribute(name) {
                        values.push(value.to_string());
                    }
                }
            }
        }
        Ok(values)
    }

    /// Writes `replacement` at every location the XPath selects and returns the
    /// number of locations written. No match leaves the document untouched; an
    /// attribute step creates the attribute on matched elements that lack it.
    pub fn update(&mut self, xpath: &str, replacement: &XmlReplacement) -> Result<usize, XmlError> {
        let path = XPath::parse(xpath)?;
        let locations = path.select(&self.root);
        let mut written = 0;

        // Deepest first so replacing a subtree never invalidates a pending location.
        for location in locations.iter().rev() {
            let Some(element) = self.element_mut(location) else {
                continue;
            };
            match (&path.target, replacement) {
                (Target::Attribute(name), replacement) => {
                    element.set_attribute(name, replacement_text(replacement));
                }
                (Target::Text, replacement) => element.set_text(replacement_text(replacement)),
                (Target::Element, XmlReplacement::Text(text)) => element.set_text(text.clone()),
                (Target::Element, XmlReplacement::Element(new)) => *element = new.clone(),
            }
            written += 1;
        }
        Ok(written)
    }

    fn element(&self, path: &[usize]) -> Option<&XmlElement> {
        element_at(&self.root, path)
    }

    fn element_mut(&mut self, path: &[usize]) -> Option<&mut XmlElement> {
        let mut current = &mut self.root;
        for index in path {
            match current.children.get_mut(*index)? {
                XmlNode::Element(element) => current = element,
                _ => return None,
            }
        }
        Some(current)
    }
}

impl fmt::Display for XmlDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        for node in &self.prolog {
            node.write_to(&mut out);
        }
        self.root.write_to(&mut out);
        for node in &self.epilog {
            node.write_to(&mut out);
        }
        f.write_str(&out)
    }
}

fn replacement_text(replacement: &XmlReplacement) -> String {
    match replacement {
        XmlReplacement::Text(text) => text.clone(),
        XmlReplacement::Element(element) => element.text(),
    }
}

fn element_from(start: &BytesStart<'_>, self_closing: bool) -> Result<XmlElement, XmlError> {
    let mut element = XmlElement::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
    element.self_closing = self_closing;
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|e| XmlError::Parse(e.to_string()))?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        let value = attribute
            .unescape_value()
            .map_err(|e| XmlError::Parse(e.to_string()))?
            .into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[derive(Default)]
struct TreeBuilder {
    stack: Vec<XmlElement>,
    prolog: Vec<XmlNode>,
    root: Option<XmlElement>,
    epilog: Vec<XmlNode>,
}

impl TreeBuilder {
    fn push(&mut self, node: XmlNode) -> Result<(), XmlError> {
        if let Some(parent) = self.stack.last_mut() {
            parent.children.push(node);
            return Ok(());
        }
        match node {
            XmlNode::Element(element) if self.root.is_none() => self.root = Some(element),
            XmlNode::Element(_) => {
                return Err(XmlError::Parse("more than one root element".to_string()))
            }
            XmlNode::Text(text) | XmlNode::CData(text) if !text.trim().is_empty() => {
                return Err(XmlError::Parse(format!(
                    "text '{}' outside the root element",
                    text.trim()
                )))
            }
            node if self.root.is_none() => self.prolog.push(node),
            node => self.epilog.push(node),
        }
        Ok(())
    }

    fn finish(self) -> Result<XmlDocument, XmlError> {
        if let Some(open) = self.stack.last() {
            return Err(XmlError::Parse(format!("unclosed element <{}>", open.name)));
        }
        let root = self
            .root
            .ok_or_else(|| XmlError::Parse("document has no root element".to_string()))?;
        Ok(XmlDocument {
            prolog: self.prolog,
            root,
            epilog: self.epilog,
        })
    }
}

// ── XPath ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Target {
    Element,
    Attribute(String),
    Text,
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    Position(usize),
    Attribute { name: String, value: Option<String> },
    Child { name: String, value: String },
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    descendant: bool,
    name: Option<String>,
    predicates: Vec<Predicate>,
}

impl Step {
    fn matches_name(&self, element: &XmlElement) -> bool {
        self.name.as_deref().map_or(true, |name| element.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct XPath {
    steps: Vec<Step>,
    target: Target,
}

impl XPath {
    fn parse(xpath: &str) -> Result<Self, XmlError> {
        let invalid = |reason: &str| XmlError::InvalidXPath {
            xpath: xpath.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = xpath.trim();
        if !trimmed.starts_with('/') {
            return Err(invalid("only absolute paths are supported"));
        }

        let mut steps = Vec::new();
        let mut target = Target::Element;
        let raw_steps = split_steps(trimmed).map_err(|reason| invalid(reason.as_str()))?;
        let count = raw_steps.len();

        for (i, (descendant, raw)) in raw_steps.into_iter().enumerate() {
            if raw.is_empty() {
                return Err(invalid("empty step"));
            }
            let last = i + 1 == count;
            if let Some(attribute) = raw.strip_prefix('@') {
                if !last || descendant {
                    return Err(invalid("an attribute step must be the final child step"));
                }
                target = Target::Attribute(attribute.to_string());
                continue;
            }
            if raw == "text()" {
                if !last || descendant {
                    return Err(invalid("text() must be the final child step"));
                }
                target = Target::Text;
                continue;
            }
            steps.push(parse_step(descendant, &raw).map_err(|reason| invalid(reason.as_str()))?);
        }

        if steps.is_empty() {
            return Err(invalid("no element step"));
        }
        Ok(Self { steps, target })
    }

    /// Child-index paths from the root of every selected element, in document order
    fn select(&self, root: &XmlElement) -> Vec<Vec<usize>> {
        let mut context: Vec<Vec<usize>> = Vec::new();

        for (position, step) in self.steps.iter().enumerate() {
            let mut next = BTreeSet::new();
            if position == 0 {
                let mut candidates = Vec::new();
                if step.descendant {
                    descendants_or_self(root, Vec::new(), &mut candidates);
                } else {
                    candidates.push((Vec::new(), root));
                }
                next.extend(filter(step, candidates));
            } else {
                for path in &context {
                    let Some(element) = element_at(root, path) else {
                        continue;
                    };
                    let mut candidates = Vec::new();
                    for (index, child) in element.child_elements() {
                        let mut child_path = path.clone();
                        child_path.push(index);
                        if step.descendant {
                            descendants_or_self(child, child_path, &mut candidates);
                        } else {
                            candidates.push((child_path, child));
                        }
                    }
                    next.extend(filter(step, candidates));
                }
            }
            context = next.into_iter().collect();
        }
        context
    }
}

fn split_steps(xpath: &str) -> Result<Vec<(bool, String)>, String> {
    let mut steps = Vec::new();
    let mut current = String::new();
    let mut descendant = false;
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut chars = xpath.chars().peekable();

    // Leading separator
    chars.next();
    if chars.peek() == Some(&'/') {
        chars.next();
        descendant = true;
    }

    while let Some(c) = chars.next() {
        match (c, quote) {
            (q, Some(open)) if q == open => {
                quote = None;
                current.push(c);
            }
            (_, Some(_)) => current.push(c),
            ('\'' | '"', None) => {
                quote = Some(c);
                current.push(c);
            }
            ('[', None) => {
                depth += 1;
                current.push(c);
            }
            (']', None) => {
                depth = depth.checked_sub(1).ok_or("unbalanced ']'")?;
                current.push(c);
            }
            ('/', None) if depth == 0 => {
                steps.push((descendant, std::mem::take(&mut current)));
                descendant = false;
                if chars.peek() == Some(&'/') {
                    chars.next();
                    descendant = true;
                }
            }
            _ => current.push(c),
        }
    }
    if quote.is_some() {
        return Err("unterminated string literal".to_string());
    }
    if depth != 0 {
        return Err("unbalanced '['".to_string());
    }
    steps.push((descendant, current));
    Ok(steps)
}

fn parse_step(descendant: bool, raw: &str) -> Result<Step, String> {
    let (name, mut rest) = match raw.find('[') {
        Some(i) => (&raw[..i], &raw[i..]),
        None => (raw, ""),
    };
    if name.is_empty() {
        return Err("missing element name".to_string());
    }
    if !name.chars().all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '*')) {
        return Err(format!("unsupported step '{}'", name));
    }

    let mut predicates = Vec::new();
    while !rest.is_empty() {
        let close = closing_bracket(rest).ok_or("unbalanced predicate")?;
        predicates.push(parse_predicate(rest[1..close].trim())?);
        rest = &rest[close + 1..];
    }

    Ok(Step {
        descendant,
        name: (name != "*").then(|| name.to_string()),
        predicates,
    })
}

fn closing_bracket(input: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in input.char_indices().skip(1) {
        match (c, quote) {
            (q, Some(open)) if q == open => quote = None,
            (_, Some(_)) => {}
            ('\'' | '"', None) => quote = Some(c),
            (']', None) => return Some(i),
            _ => {}
        }
    }
    None
}

fn parse_predicate(body: &str) -> Result<Predicate, String> {
    if let Ok(position) = body.parse::<usize>() {
        if position == 0 {
            return Err("positions start at 1".to_string());
        }
        return Ok(Predicate::Position(position));
    }

    let (left, value) = match body.split_once('=') {
        Some((left, right)) => (left.trim(), Some(unquote(right.trim())?)),
        None => (body, None),
    };

    match (left.strip_prefix('@'), value) {
        (Some(name), value) => Ok(Predicate::Attribute {
            name: name.to_string(),
            value,
        }),
        (None, Some(value)) => Ok(Predicate::Child {
            name: left.to_string(),
            value,
        }),
        (None, None) => Err(format!("unsupported predicate '{}'", body)),
    }
}

fn unquote(literal: &str) -> Result<String, String> {
    let mut chars = literal.chars();
    match (chars.next(), chars.next_back()) {
        (Some(open @ ('\'' | '"')), Some(close)) if open == close && literal.len() >= 2 => {
            Ok(chars.collect())
        }
        _ => Err(format!("expected a quoted literal, got '{}'", literal)),
    }
}

fn descendants_or_self<'a>(
    element: &'a XmlElement,
    path: Vec<usize>,
    out: &mut Vec<(Vec<usize>, &'a XmlElement)>,
) {
    for (index, child) in element.child_elements() {
        let mut child_path = path.clone();
        child_path.push(index);
        descendants_or_self(child, child_path, out);
    }
    out.push((path, element));
}

fn filter<'a>(step: &Step, candidates: Vec<(Vec<usize>, &'a XmlElement)>) -> Vec<Vec<usize>> {
    let mut selected: Vec<(Vec<usize>, &XmlElement)> = candidates
        .into_iter()
        .filter(|(_, element)| step.matches_name(element))
        .collect();
    selected.sort_by(|a, b| a.0.cmp(&b.0));

    for predicate in &step.predicates {
        selected = match predicate {
            // Positions count among siblings of the same parent
            Predicate::Position(position) => {
                let mut seen: BTreeMap<Option<Vec<usize>>, usize> = BTreeMap::new();
                selected
                    .into_iter()
                    .filter(|(path, _)| {
                        let parent = path.split_last().map(|(_, parent)| parent.to_vec());
                        let count = seen.entry(parent).or_insert(0);
                        *count += 1;
                        *count == *position
                    })
                    .collect()
            }
            Predicate::Attribute { name, value } => selected
                .into_iter()
                .filter(|(_, element)| match (element.attribute(name), value) {
                    (Some(actual), Some(expected)) => actual == expected,
                    (Some(_), None) => true,
                    (None, _) => false,
                })
                .collect(),
            Predicate::Child { name, value } => selected
                .into_iter()
                .filter(|(_, element)| {
                    element
                        .child_elements()
                        .any(|(_, child)| &child.name == name && &child.text() == value)
                })
                .collect(),
        };
    }
    selected.into_iter().map(|(path, _)| path).collect()
}

fn element_at<'a>(root: &'a XmlElement, path: &[usize]) -> Option<&'a XmlElement> {
    let mut current = root;
    for index in path {
        match current.children.get(*index)? {
            XmlNode::Element(element) => current = element,
            _ => return None,
        }
    }
    Some(current)
}

/// Checks an XPath without evaluating it
pub fn validate_xpath(xpath: &str) -> Result<(), XmlError> {
    XPath::parse(xpath).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER: &str = r#"<order id="42"><customer>Ada</customer><items><item sku="a1"><qty>1</qty></item><item sku="b2"><qty>3</qty></item></items></order>"#;

    #[test]
    fn test_parse_and_render() {
        let doc = XmlDocument::parse(ORDER).unwrap();
        assert_eq!(doc.root.name, "order");
        assert_eq!(doc.root.attribute("id"), Some("42"));
        assert_eq!(doc.to_string(), ORDER);
    }

    #[test]
    fn test_escaped_text_survives_round_trip() {
        let doc = XmlDocument::parse("<a>1 &lt; 2 &amp; 3</a>").unwrap();
        assert_eq!(doc.root.text(), "1 < 2 & 3");
        assert_eq!(doc.to_string(), "<a>1 &lt; 2 &amp; 3</a>");
    }

    #[test]
    fn test_malformed_xml_is_rejected() {
        assert!(matches!(XmlDocument::parse("<a><b></a>"), Err(XmlError::Parse(_))));
        assert!(matches!(XmlDocument::parse("<a>"), Err(XmlError::Parse(_))));
        assert!(matches!(XmlDocument::parse(""), Err(XmlError::Parse(_))));
    }

    #[test]
    fn test_read_paths() {
        let doc = XmlDocument::parse(ORDER).unwrap();
        assert_eq!(doc.read("/order/customer").unwrap(), vec!["Ada"]);
        assert_eq!(doc.read("/order/@id").unwrap(), vec!["42"]);
        assert_eq!(doc.read("//qty").unwrap(), vec!["1", "3"]);
        assert_eq!(doc.read("/order/items/item[2]/qty/text()").unwrap(), vec!["3"]);
        assert_eq!(doc.read("//item[@sku='a1']/qty").unwrap(), vec!["1"]);
        assert_eq!(doc.read("//item[qty='3']/@sku").unwrap(), vec!["b2"]);
        assert_eq!(doc.read("/order/*/item/@sku").unwrap(), vec!["a1", "b2"]);
    }

    #[test]
    fn test_update_text_is_idempotent() {
        let mut doc = XmlDocument::parse(ORDER).unwrap();
        let replacement = XmlReplacement::Text("Grace".to_string());
        assert_eq!(doc.update("/order/customer/text()", &replacement).unwrap(), 1);
        let once = doc.to_string();
        doc.update("/order/customer/text()", &replacement).unwrap();
        assert_eq!(doc.to_string(), once);
        assert_eq!(doc.read("/order/customer").unwrap(), vec!["Grace"]);
    }

    #[test]
    fn test_update_applies_to_all_matches() {
        let mut doc = XmlDocument::parse(ORDER).unwrap();
        let written = doc
            .update("//qty", &XmlReplacement::Text("0".to_string()))
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(doc.read("//qty").unwrap(), vec!["0", "0"]);
    }

    #[test]
    fn test_update_without_match_is_a_no_op() {
        let mut doc = XmlDocument::parse(ORDER).unwrap();
        let written = doc
            .update("/order/missing", &XmlReplacement::Text("x".to_string()))
            .unwrap();
        assert_eq!(written, 0);
        assert_eq!(doc.to_string(), ORDER);
    }

    #[test]
    fn test_update_creates_missing_attribute_on_match() {
        let mut doc = XmlDocument::parse(ORDER).unwrap();
        doc.update("/order/customer/@vip", &XmlReplacement::Text("true".to_string()))
            .unwrap();
        assert_eq!(doc.read("/order/customer/@vip").unwrap(), vec!["true"]);
    }

    #[test]
    fn test_update_replaces_subtree() {
        let mut doc = XmlDocument::parse(ORDER).unwrap();
        let replacement = XmlDocument::parse("<item sku=\"c3\"><qty>9</qty></item>").unwrap();
        doc.update("//item[1]", &XmlReplacement::Element(replacement.root))
            .unwrap();
        assert_eq!(doc.read("//item/@sku").unwrap(), vec!["c3", "b2"]);
    }

    #[test]
    fn test_update_leaves_the_rest_of_the_document_alone() {
        let input = "<?xml version=\"1.0\"?>\n<!-- keep -->\n<a>\n  <b> padded </b>\n  <?mark here?><c>x</c><d></d><e/>\n</a>\n";
        let mut doc = XmlDocument::parse(input).unwrap();
        assert_eq!(doc.to_string(), input);

        let written = doc.update("/a/c", &XmlReplacement::Text("y".to_string())).unwrap();
        assert_eq!(written, 1);
        assert_eq!(doc.to_string(), input.replace("<c>x</c>", "<c>y</c>"));
        assert_eq!(doc.read("/a/b").unwrap(), vec![" padded "]);
    }

    #[test]
    fn test_text_outside_root_is_rejected() {
        assert!(matches!(XmlDocument::parse("<a/>stray"), Err(XmlError::Parse(_))));
        assert!(XmlDocument::parse("<a/>\n<!-- trailing -->\n").is_ok());
    }

    #[test]
    fn test_position_counts_within_each_parent() {
        let doc = XmlDocument::parse(
            "<lists><list><item>a</item><item>b</item></list><list><item>c</item></list></lists>",
        )
        .unwrap();
        assert_eq!(doc.read("//item[1]").unwrap(), vec!["a", "c"]);
        assert_eq!(doc.read("//item[2]").unwrap(), vec!["b"]);
        assert_eq!(doc.read("/lists/list[2]/item[1]").unwrap(), vec!["c"]);
    }

    #[test]
    fn test_invalid_xpath() {
        for xpath in ["order", "/order/@id/name", "/order[", "/order[0]", "/", "/a[@b='c]"] {
            assert!(
                matches!(validate_xpath(xpath), Err(XmlError::InvalidXPath { .. })),
                "{} should be rejected",
                xpath
            );
        }
    }
}
