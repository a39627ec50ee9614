//! DOCTYPE handling for fetched feed documents.
//!
//! `feed-rs` (via quick-xml) never expands entity declarations, but a DTD in
//! an untrusted feed is still a policy decision: the default is to reject the
//! document outright. The scan only walks the XML prologue and stops at the
//! first element, so it is cheap even for large bodies.

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

/// How to treat a DOCTYPE declaration in a fetched feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtdPolicy {
    /// Reject documents carrying a DTD (default).
    #[default]
    Prohibit,
    /// Pass the document through unchanged.
    Allow,
    /// Strip the DOCTYPE declaration before parsing.
    Ignore,
}

/// Byte span of the DOCTYPE declaration in the prologue, if any.
fn doctype_span(bytes: &[u8]) -> Result<Option<(usize, usize)>, quick_xml::Error> {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();
    loop {
        let start = reader.buffer_position() as usize;
        match reader.read_event_into(&mut buf)? {
            Event::DocType(_) => {
                let end = reader.buffer_position() as usize;
                return Ok(Some((start, end)));
            }
            // The prologue ends at the first element (or at EOF).
            Event::Start(_) | Event::Empty(_) | Event::Eof => return Ok(None),
            _ => {}
        }
        buf.clear();
    }
}

pub fn contains_doctype(bytes: &[u8]) -> Result<bool, quick_xml::Error> {
    Ok(doctype_span(bytes)?.is_some())
}

pub fn strip_doctype(bytes: Vec<u8>) -> Result<Vec<u8>, quick_xml::Error> {
    match doctype_span(&bytes)? {
        Some((start, end)) => {
            let mut out = bytes;
            out.drain(start..end);
            Ok(out)
        }
        None => Ok(bytes),
    }
}
