use ontopic_graph::{Result, TopicError};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::fmt;
use std::io::Cursor;

const ROOT: &str = "attributes";
const ELEMENT: &str = "attribute";

fn xml_error<E: fmt::Display>(err: E) -> TopicError {
    TopicError::Serialization(format!("extended attributes: {err}"))
}

/// Serialize extended attribute values as
/// `<attributes><attribute key="Body">…</attribute></attributes>`.
/// Values are escaped exactly once.
pub fn encode_attributes<'a, I>(values: I) -> Result<String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .write_event(Event::Start(BytesStart::new(ROOT)))
        .map_err(xml_error)?;

    for (key, value) in values {
        let mut element = BytesStart::new(ELEMENT);
        element.push_attribute(("key", key));
        writer.write_event(Event::Start(element)).map_err(xml_error)?;
        writer
            .write_event(Event::Text(BytesText::new(value)))
            .map_err(xml_error)?;
        writer
            .write_event(Event::End(BytesEnd::new(ELEMENT)))
            .map_err(xml_error)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new(ROOT)))
        .map_err(xml_error)?;
    String::from_utf8(writer.into_inner().into_inner()).map_err(xml_error)
}

/// Parse a document written by [`encode_attributes`]. CDATA sections are
/// taken verbatim.
pub fn decode_attributes(xml: &str) -> Result<Vec<(String, String)>> {
    let mut reader = Reader::from_str(xml);
    let mut values = Vec::new();
    let mut current: Option<(String, String)> = None;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(element) if element.name().as_ref() == ELEMENT.as_bytes() => {
                current = Some((attribute_key(&element)?, String::new()));
            }
            Event::Empty(element) if element.name().as_ref() == ELEMENT.as_bytes() => {
                values.push((attribute_key(&element)?, String::new()));
            }
            Event::Text(text) => {
                if let Some((_, value)) = current.as_mut() {
                    value.push_str(&text.unescape().map_err(xml_error)?);
                }
            }
            Event::CData(data) => {
                if let Some((_, value)) = current.as_mut() {
                    value.push_str(std::str::from_utf8(&data).map_err(xml_error)?);
                }
            }
            Event::End(element) if element.name().as_ref() == ELEMENT.as_bytes() => {
                if let Some(entry) = current.take() {
                    values.push(entry);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(values)
}

fn attribute_key(element: &BytesStart) -> Result<String> {
    let key = element
        .try_get_attribute("key")
        .map_err(xml_error)?
        .ok_or_else(|| TopicError::Serialization("attribute element without a key".to_string()))?;
    Ok(key.unescape_value().map_err(xml_error)?.into_owned())
}
