//! Parsers for the runtime's semi-structured command output
//!
//! Two formats cross this boundary: pipe-delimited event records from the
//! event tail, and pipe-delimited rows from the container listing. Both
//! degrade row by row: a bad record never aborts the batch that carried it.

use crate::error::ProtocolError;
use crate::events::{EventAction, StructuredEvent};
use crate::types::{ContainerState, ContainerSummary};

/// Field order of one event record: `type|action|id|name|image|time`
const EVENT_FIELDS: usize = 6;

/// Field order of one listing row: `id|name|state|image`
const LISTING_FIELDS: usize = 4;

/// Placeholder the runtime's formatter prints for an unresolvable field
const UNRESOLVED_PLACEHOLDER: &str = "<no value>";

/// Whether an actor name field carries a usable container name
pub fn is_resolved_name(name: &str) -> bool {
    !name.is_empty() && name != UNRESOLVED_PLACEHOLDER
}

/// Parse one event-tail record.
///
/// The tail requests container records only, so any other record type is
/// rejected along with rows that are short a field or carry an unparseable
/// timestamp. The timestamp field is milliseconds since the Unix epoch.
pub fn parse_event_line(line: &str) -> Result<StructuredEvent, ProtocolError> {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() < EVENT_FIELDS {
        return Err(ProtocolError::MalformedEvent(line.to_string()));
    }
    if fields[0].trim() != "container" {
        return Err(ProtocolError::MalformedEvent(line.to_string()));
    }
    let raw_time = fields[fields.len() - 1].trim();
    let time_ms: u64 = raw_time
        .parse()
        .map_err(|_| ProtocolError::InvalidTimestamp(raw_time.to_string()))?;

    Ok(StructuredEvent::container(
        EventAction::parse(fields[1]),
        fields[2].trim(),
        fields[3].trim(),
        fields[4].trim(),
        time_ms,
    ))
}

/// Parse a whole event-tail batch, skipping malformed rows.
///
/// Returns the parsed events and the number of rows dropped; callers log
/// the drop count so a noisy host is visible without killing the stream.
pub fn parse_event_batch(output: &str) -> (Vec<StructuredEvent>, usize) {
    let mut events = Vec::new();
    let mut skipped = 0;
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match parse_event_line(line) {
            Ok(event) => events.push(event),
            Err(err) => {
                skipped += 1;
                tracing::warn!(error = %err, "skipping malformed event record");
            }
        }
    }
    (events, skipped)
}

/// Parse the container listing.
///
/// A row with too few fields still names a container we cannot describe,
/// so it degrades to `ContainerState::Unknown` rather than aborting the
/// listing. Extra separators can only come from an image reference, which
/// is the trailing field, so they are folded back into it.
pub fn parse_container_listing(output: &str) -> Vec<ContainerSummary> {
    let mut containers = Vec::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() >= LISTING_FIELDS {
            containers.push(ContainerSummary {
                id: fields[0].trim().to_string(),
                name: fields[1].trim().to_string(),
                state: ContainerState::parse_label(fields[2]),
                image: fields[3..].join("|").trim().to_string(),
            });
        } else {
            tracing::warn!(row = %line, "unparseable listing row, recording state as unknown");
            containers.push(ContainerSummary {
                id: fields[0].trim().to_string(),
                name: fields.get(1).map(|f| f.trim().to_string()).unwrap_or_default(),
                state: ContainerState::Unknown,
                image: String::new(),
            });
        }
    }
    containers
}
