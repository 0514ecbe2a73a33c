//! Stanza boundary detection on the raw XML byte stream.
//!
//! XMPP over TCP is one long XML document: a `<stream:stream>` wrapper
//! whose direct children are the stanzas. The reader below walks quick-xml
//! events over the accumulated buffer and cuts out one complete top-level
//! element at a time, reporting the stream header and footer as their own
//! frame kinds so the negotiation phase and the receive loop can react to
//! them without string-matching.

use quick_xml::errors::SyntaxError;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::error;

/// One framed unit cut from the inbound byte stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Opening `<stream:stream ...>` tag (XML declaration included when
    /// present).
    StreamHeader(String),
    /// Closing `</stream:stream>` — the peer is done with us.
    StreamEnd,
    /// A complete top-level stanza.
    Stanza(String),
}

const STREAM_END: &[u8] = b"</stream:stream>";

fn stream_element(name: &[u8], local: &[u8]) -> bool {
    name == b"stream:stream" || local == b"stream"
}

fn slice_to_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Extract the next complete frame from `buffer`.
///
/// Returns the frame plus the number of bytes consumed, or `None` when the
/// buffer does not yet hold a complete frame (the caller keeps reading).
/// The caller is responsible for draining the consumed prefix.
pub fn next_frame(buffer: &[u8]) -> Option<(Frame, usize)> {
    // The stream footer arrives without a matching opener in the buffer and
    // confuses a depth-tracking walk, so it is special-cased up front.
    let first = buffer
        .iter()
        .position(|&b| !matches!(b, b' ' | b'\t' | b'\r' | b'\n'))?;
    if buffer[first..].starts_with(STREAM_END) {
        return Some((Frame::StreamEnd, first + STREAM_END.len()));
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut start: usize = 0;
    let mut in_stanza = false;

    loop {
        let pos = reader.buffer_position() as usize;
        match reader.read_event() {
            // Stream-level metadata before the header
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_))
            | Ok(Event::DocType(_)) => continue,
            Ok(Event::Start(e)) => {
                if !in_stanza && stream_element(e.name().as_ref(), e.name().local_name().as_ref())
                {
                    let end = reader.buffer_position() as usize;
                    return Some((Frame::StreamHeader(slice_to_string(&buffer[..end])), end));
                }
                depth += 1;
                if !in_stanza && depth == 1 {
                    in_stanza = true;
                    start = pos;
                }
            }
            Ok(Event::Empty(e)) => {
                if !in_stanza && stream_element(e.name().as_ref(), e.name().local_name().as_ref())
                {
                    let end = reader.buffer_position() as usize;
                    return Some((Frame::StreamHeader(slice_to_string(&buffer[..end])), end));
                }
                // Self-closing top-level stanza, e.g. <presence/>
                if !in_stanza && depth == 0 {
                    let end = reader.buffer_position() as usize;
                    return Some((Frame::Stanza(slice_to_string(&buffer[pos..end])), end));
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
            Ok(Event::End(e)) => {
                if depth == 0
                    && stream_element(e.name().as_ref(), e.name().local_name().as_ref())
                {
                    let end = reader.buffer_position() as usize;
                    return Some((Frame::StreamEnd, end));
                }
                depth = depth.saturating_sub(1);
                if in_stanza && depth == 0 {
                    let end = reader.buffer_position() as usize;
                    return Some((Frame::Stanza(slice_to_string(&buffer[start..end])), end));
                }
            }
            // More bytes needed from the wire
            Ok(Event::Eof) => return None,
            Err(quick_xml::Error::Syntax(SyntaxError::UnclosedTag)) => return None,
            Err(e) => {
                error!(error = ?e, "XML framing error");
                return None;
            }
        }
    }
}
