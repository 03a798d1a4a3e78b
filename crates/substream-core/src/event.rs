//! Events and Stream Batches
//!
//! An **event** is one entry of a partition's log: its offset, the time it was
//! appended and an opaque JSON payload. A **stream batch** is the unit a
//! session pushes to its client: the events of one partition plus the cursor
//! the client must commit to acknowledge them.
//!
//! ## Wire Format
//!
//! Batches are written as newline-terminated JSON documents so a client can
//! resynchronize after a partial read by skipping to the next newline:
//!
//! ```text
//! {"cursor":{"event_type":"orders","partition":0,"offset":7},"events":[{...},{...}]}
//! {"cursor":null,"events":[]}
//! ```
//!
//! The second line is a keep-alive batch, emitted when a flush cycle found no
//! events to deliver.
//!
//! ## Design Decisions
//! - Payloads are `bytes::Bytes` so fan-out to several sessions never copies
//! - Payloads are written as stored, except that CR and LF become spaces.
//!   Line breaks can only be insignificant whitespace in a valid JSON
//!   document, and one batch must stay one line.

use crate::error::Result;
use crate::partition::Cursor;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// A single event read from a partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Offset of this event in its partition
    pub offset: u64,

    /// Append timestamp in milliseconds since epoch
    pub timestamp: u64,

    /// JSON document (raw bytes)
    pub payload: Bytes,
}

impl Event {
    pub fn new(offset: u64, timestamp: u64, payload: Bytes) -> Self {
        Self {
            offset,
            timestamp,
            payload,
        }
    }
}

/// One self-delimited unit of a session's output stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBatch {
    /// Cursor of the last event in the batch (`None` for keep-alive batches)
    pub cursor: Option<Cursor>,

    /// Events in partition order
    pub events: Vec<Event>,
}

impl StreamBatch {
    /// Build a data batch; the cursor points at the last event
    pub fn new(cursor: Cursor, events: Vec<Event>) -> Self {
        Self {
            cursor: Some(cursor),
            events,
        }
    }

    /// Build an empty keep-alive batch
    pub fn keep_alive() -> Self {
        Self {
            cursor: None,
            events: Vec::new(),
        }
    }

    pub fn is_keep_alive(&self) -> bool {
        self.events.is_empty()
    }

    /// Render this batch as one newline-terminated JSON line
    pub fn to_json_line(&self) -> Result<Bytes> {
        let cursor = serde_json::to_vec(&self.cursor)?;
        let payload_len: usize = self.events.iter().map(|e| e.payload.len() + 1).sum();

        let mut buf = BytesMut::with_capacity(cursor.len() + payload_len + 32);
        buf.put_slice(b"{\"cursor\":");
        buf.put_slice(&cursor);
        buf.put_slice(b",\"events\":[");
        for (i, event) in self.events.iter().enumerate() {
            if i > 0 {
                buf.put_u8(b',');
            }
            put_single_line(&mut buf, &event.payload);
        }
        buf.put_slice(b"]}\n");

        Ok(buf.freeze())
    }
}

fn put_single_line(buf: &mut BytesMut, payload: &[u8]) {
    if !payload.iter().any(|b| matches!(b, b'\n' | b'\r')) {
        buf.put_slice(payload);
        return;
    }
    buf.extend(payload.iter().map(|b| match b {
        b'\n' | b'\r' => b' ',
        other => *other,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::Partition;

    fn event(offset: u64, body: &'static str) -> Event {
        Event::new(offset, 1_700_000_000_000, Bytes::from_static(body.as_bytes()))
    }

    #[test]
    fn test_data_batch_json_line() {
        let batch = StreamBatch::new(
            Cursor::new(Partition::new("orders", 0), 8),
            vec![event(7, r#"{"id":7}"#), event(8, r#"{"id":8}"#)],
        );

        let line = batch.to_json_line().unwrap();
        assert_eq!(line.last(), Some(&b'\n'));

        let parsed: serde_json::Value = serde_json::from_slice(&line[..line.len() - 1]).unwrap();
        assert_eq!(parsed["cursor"]["event_type"], "orders");
        assert_eq!(parsed["cursor"]["offset"], 8);
        assert_eq!(parsed["events"][0]["id"], 7);
        assert_eq!(parsed["events"][1]["id"], 8);
    }

    #[test]
    fn test_keep_alive_json_line() {
        let batch = StreamBatch::keep_alive();
        assert!(batch.is_keep_alive());

        let line = batch.to_json_line().unwrap();
        assert_eq!(&line[..], b"{\"cursor\":null,\"events\":[]}\n");
    }

    #[test]
    fn test_lines_contain_no_inner_newlines() {
        let batch = StreamBatch::new(
            Cursor::new(Partition::new("orders", 0), 1),
            vec![event(1, r#"{"a":1}"#)],
        );
        let line = batch.to_json_line().unwrap();
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn test_pretty_printed_payload_stays_on_one_line() {
        let batch = StreamBatch::new(
            Cursor::new(Partition::new("orders", 0), 2),
            vec![
                event(1, "{\n  \"a\": 1\n}"),
                event(2, "{\r\n  \"b\": \"x y\"\r\n}"),
            ],
        );

        let line = batch.to_json_line().unwrap();
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
        assert!(!line.contains(&b'\r'));

        let parsed: serde_json::Value = serde_json::from_slice(&line[..line.len() - 1]).unwrap();
        assert_eq!(parsed["events"][0]["a"], 1);
        assert_eq!(parsed["events"][1]["b"], "x y");
    }
}
