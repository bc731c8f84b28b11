//! BPMN XML extension-property extraction.
//!
//! The engine serves the deployed diagram as XML; routing metadata lives in
//! `<camunda:properties><camunda:property name=".." value=".."/></..>`
//! blocks under each activity. Deployed definitions are immutable, so the
//! output of this parse is cacheable for the life of the process.

use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;

/// Extension properties per activity id.
pub type ActivityProperties = HashMap<String, HashMap<String, String>>;

#[derive(Debug, thiserror::Error)]
pub enum BpmnError {
    #[error("xml: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("property element without name/value at activity '{0}'")]
    MalformedProperty(String),
}

/// Parse a BPMN document and collect every activity's extension properties.
///
/// A `property` element (any vendor prefix) is attributed to the nearest
/// enclosing element that carries an `id` attribute, which for well-formed
/// diagrams is the activity owning the `extensionElements` block.
pub fn extension_properties(xml: &str) -> Result<ActivityProperties, BpmnError> {
    let mut reader = Reader::from_str(xml);

    let mut out: ActivityProperties = HashMap::new();
    // One entry per open element: its `id` attribute, if any.
    let mut id_stack: Vec<Option<String>> = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if local_name(e.name().as_ref()) == b"property" {
                    record_property(&e, &id_stack, &mut out)?;
                }
                id_stack.push(attr_value(&e, b"id")?);
            }
            Event::Empty(e) => {
                if local_name(e.name().as_ref()) == b"property" {
                    record_property(&e, &id_stack, &mut out)?;
                }
            }
            Event::End(_) => {
                id_stack.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(out)
}

fn local_name(qname: &[u8]) -> &[u8] {
    match qname.iter().rposition(|&b| b == b':') {
        Some(pos) => &qname[pos + 1..],
        None => qname,
    }
}

fn attr_value(
    e: &quick_xml::events::BytesStart<'_>,
    key: &[u8],
) -> Result<Option<String>, BpmnError> {
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        if local_name(attr.key.as_ref()) == key {
            let value = attr
                .unescape_value()
                .map_err(quick_xml::Error::from)?
                .into_owned();
            return Ok(Some(value));
        }
    }
    Ok(None)
}

fn record_property(
    e: &quick_xml::events::BytesStart<'_>,
    id_stack: &[Option<String>],
    out: &mut ActivityProperties,
) -> Result<(), BpmnError> {
    let owner = id_stack
        .iter()
        .rev()
        .find_map(|id| id.clone())
        .unwrap_or_default();

    let name = attr_value(e, b"name")?;
    let value = attr_value(e, b"value")?;
    match (name, value) {
        (Some(name), Some(value)) => {
            out.entry(owner).or_default().insert(name, value);
            Ok(())
        }
        _ => Err(BpmnError::MalformedProperty(owner)),
    }
}
