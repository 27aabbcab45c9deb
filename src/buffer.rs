use crate::{
    envelope::Payload,
    range::{Point, Range},
};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a registered fingerprint may wait for its echo before being
/// purged, and how many may be outstanding at once.
const FINGERPRINT_TTL: Duration = Duration::from_secs(2);
const FINGERPRINT_CAP: usize = 512;

/// A change event as reported by the external editor buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferChange {
    pub old_range: Range,
    pub new_range: Range,
    pub old_text: String,
    pub new_text: String,
}

/// The interface the core needs from a host-environment text buffer.
pub trait TextBuffer: Send {
    fn uri(&self) -> &str;
    fn snapshot(&self) -> String;
    fn text_in_range(&self, range: Range) -> String;
    fn insert(&mut self, at: Point, text: &str);
    fn delete(&mut self, range: Range) -> String;
}

/// Couples a shared text buffer to the replication engine: turns editor
/// change events into typed insert/delete messages, and applies remote
/// operations back while suppressing their echo.
pub struct BufferProxy {
    id: String,
    buffer: Arc<Mutex<dyn TextBuffer>>,
    fingerprints: Mutex<HashMap<u64, Instant>>,
}

impl BufferProxy {
    pub fn new(id: impl Into<String>, buffer: Arc<Mutex<dyn TextBuffer>>) -> Self {
        Self {
            id: id.into(),
            buffer,
            fingerprints: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> String {
        self.buffer.lock().expect("buffer lock").snapshot()
    }

    /// Converts an editor change event into outbound messages. An event that
    /// matches a registered fingerprint is the echo of a remote application
    /// and is swallowed. A replace yields the delete before the insert.
    pub fn handle_change(&self, change: &BufferChange) -> Vec<Payload> {
        if self.consume_fingerprint(change) {
            return Vec::new();
        }

        let mut out = Vec::new();
        if !change.old_text.is_empty() {
            out.push(Payload::TextBufferProxyDelete {
                text_buffer_proxy_id: self.id.clone(),
                start_pos: change.old_range.start,
                end_pos: change.old_range.end,
            });
        }
        if !change.new_text.is_empty() {
            out.push(Payload::TextBufferProxyInsert {
                text_buffer_proxy_id: self.id.clone(),
                new_text: change.new_text.clone(),
                start_pos: change.new_range.start,
            });
        }
        out
    }

    /// Applies a remote insertion, registering its fingerprint under the
    /// same lock so the echo event cannot race past it.
    pub fn insert_at(&self, at: Point, text: &str) {
        let mut buffer = self.buffer.lock().expect("buffer lock");
        self.register(fingerprint(&Range::of_insertion(at, text), text));
        buffer.insert(at, text);
    }

    /// Applies a remote deletion; see [`Self::insert_at`].
    pub fn delete_range(&self, range: Range) {
        let mut buffer = self.buffer.lock().expect("buffer lock");
        let doomed = buffer.text_in_range(range);
        self.register(fingerprint(&range, &doomed));
        buffer.delete(range);
    }

    fn register(&self, print: u64) {
        let mut prints = self.fingerprints.lock().expect("fingerprint lock");
        let now = Instant::now();
        prints.retain(|_, at| now.duration_since(*at) < FINGERPRINT_TTL);
        if prints.len() >= FINGERPRINT_CAP {
            if let Some(oldest) = prints.iter().min_by_key(|(_, at)| **at).map(|(k, _)| *k) {
                prints.remove(&oldest);
            }
        }
        prints.insert(print, now);
    }

    /// True when the event matches an outstanding fingerprint; the entry is
    /// removed either way it was found.
    fn consume_fingerprint(&self, change: &BufferChange) -> bool {
        let candidates = [
            (!change.new_text.is_empty())
                .then(|| fingerprint(&change.new_range, &change.new_text)),
            (!change.old_text.is_empty())
                .then(|| fingerprint(&change.old_range, &change.old_text)),
        ];

        let mut prints = self.fingerprints.lock().expect("fingerprint lock");
        for print in candidates.into_iter().flatten() {
            if prints.remove(&print).is_some() {
                debug!(id = %self.id, "suppressed echo of a remote application");
                return true;
            }
        }
        false
    }
}

fn fingerprint(range: &Range, text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    format!("{range}{text}").hash(&mut hasher);
    hasher.finish()
}

/// A plain in-memory buffer for tests and headless embedding. Mutations
/// emit the same change events an editor buffer would.
pub struct InMemoryBuffer {
    uri: String,
    text: String,
    changes: flume::Sender<BufferChange>,
}

impl InMemoryBuffer {
    pub fn new(
        uri: impl Into<String>,
        initial: impl Into<String>,
    ) -> (Self, flume::Receiver<BufferChange>) {
        let (tx, rx) = flume::unbounded();
        (
            Self {
                uri: uri.into(),
                text: initial.into(),
                changes: tx,
            },
            rx,
        )
    }

    /// Byte offset of a (row, column) coordinate, counting columns in chars.
    fn byte_offset(&self, point: Point) -> usize {
        let mut row = 0;
        let mut column = 0;
        for (idx, c) in self.text.char_indices() {
            if row == point.row && column == point.column {
                return idx;
            }
            if c == '\n' {
                row += 1;
                column = 0;
            } else {
                column += 1;
            }
        }
        self.text.len()
    }

    /// A user-driven edit: mutates and reports the change, exactly like a
    /// remote application would, but with no fingerprint registered.
    pub fn edit(&mut self, range: Range, replacement: &str) {
        let old_text = self.delete_silent(range);
        self.insert_silent(range.start, replacement);
        self.emit(BufferChange {
            old_range: range,
            new_range: Range::of_insertion(range.start, replacement),
            old_text,
            new_text: replacement.to_string(),
        });
    }

    fn insert_silent(&mut self, at: Point, text: &str) {
        let offset = self.byte_offset(at);
        self.text.insert_str(offset, text);
    }

    fn delete_silent(&mut self, range: Range) -> String {
        let start = self.byte_offset(range.start);
        let end = self.byte_offset(range.end);
        self.text.drain(start..end).collect()
    }

    fn emit(&self, change: BufferChange) {
        let _ = self.changes.send(change);
    }
}

impl TextBuffer for InMemoryBuffer {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn snapshot(&self) -> String {
        self.text.clone()
    }

    fn text_in_range(&self, range: Range) -> String {
        let start = self.byte_offset(range.start);
        let end = self.byte_offset(range.end);
        self.text[start..end].to_string()
    }

    fn insert(&mut self, at: Point, text: &str) {
        self.insert_silent(at, text);
        self.emit(BufferChange {
            old_range: Range { start: at, end: at },
            new_range: Range::of_insertion(at, text),
            old_text: String::new(),
            new_text: text.to_string(),
        });
    }

    fn delete(&mut self, range: Range) -> String {
        let removed = self.delete_silent(range);
        self.emit(BufferChange {
            old_range: range,
            new_range: Range {
                start: range.start,
                end: range.start,
            },
            old_text: removed.clone(),
            new_text: String::new(),
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy_over(initial: &str) -> (BufferProxy, flume::Receiver<BufferChange>) {
        let (buffer, changes) = InMemoryBuffer::new("foo.txt", initial);
        let shared: Arc<Mutex<dyn TextBuffer>> = Arc::new(Mutex::new(buffer));
        (BufferProxy::new("foo.txt", shared), changes)
    }

    #[test]
    fn test_local_insert_becomes_message() {
        let (proxy, changes) = proxy_over("ab");
        proxy.buffer.lock().unwrap().insert(Point::new(0, 1), "X");

        let change = changes.try_recv().unwrap();
        let out = proxy.handle_change(&change);
        assert_eq!(
            out,
            vec![Payload::TextBufferProxyInsert {
                text_buffer_proxy_id: "foo.txt".into(),
                new_text: "X".into(),
                start_pos: Point::new(0, 1),
            }]
        );
    }

    #[test]
    fn test_local_delete_becomes_message() {
        let (proxy, changes) = proxy_over("abcd");
        proxy
            .buffer
            .lock()
            .unwrap()
            .delete(Range::new((0, 1), (0, 3)));

        let change = changes.try_recv().unwrap();
        let out = proxy.handle_change(&change);
        assert_eq!(
            out,
            vec![Payload::TextBufferProxyDelete {
                text_buffer_proxy_id: "foo.txt".into(),
                start_pos: Point::new(0, 1),
                end_pos: Point::new(0, 3),
            }]
        );
    }

    #[test]
    fn test_replace_yields_delete_then_insert() {
        let (proxy, changes) = proxy_over("hello");
        let change = BufferChange {
            old_range: Range::new((0, 0), (0, 5)),
            new_range: Range::of_insertion(Point::zero(), "bye"),
            old_text: "hello".into(),
            new_text: "bye".into(),
        };
        drop(changes);

        let out = proxy.handle_change(&change);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Payload::TextBufferProxyDelete { .. }));
        assert!(matches!(out[1], Payload::TextBufferProxyInsert { .. }));
    }

    #[test]
    fn test_remote_application_is_not_echoed() {
        let (proxy, changes) = proxy_over("ab");
        proxy.insert_at(Point::new(0, 1), "X");

        let change = changes.try_recv().unwrap();
        assert!(proxy.handle_change(&change).is_empty());
        assert_eq!(proxy.snapshot(), "aXb");

        // The fingerprint was consumed; an identical user edit now counts.
        proxy.buffer.lock().unwrap().insert(Point::new(0, 1), "X");
        let change = changes.try_recv().unwrap();
        assert_eq!(proxy.handle_change(&change).len(), 1);
    }

    #[test]
    fn test_remote_delete_is_not_echoed() {
        let (proxy, changes) = proxy_over("aXb");
        proxy.delete_range(Range::new((0, 1), (0, 2)));

        let change = changes.try_recv().unwrap();
        assert!(proxy.handle_change(&change).is_empty());
        assert_eq!(proxy.snapshot(), "ab");
    }

    #[test]
    fn test_multiline_offsets() {
        let (mut buffer, _changes) = InMemoryBuffer::new("foo.txt", "ab\ncd\n");
        buffer.insert(Point::new(1, 1), "X\nY");
        assert_eq!(buffer.snapshot(), "ab\ncX\nYd\n");
        assert_eq!(buffer.text_in_range(Range::new((1, 0), (2, 1))), "cX\nY");
    }
}
