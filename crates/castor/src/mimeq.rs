use std::{borrow::Cow, collections::VecDeque, fs::OpenOptions, io::Write};

use tracing::warn;

use crate::{Error, mime::MimeItem, util::filedate};

const DEFAULT_BULK_CONTENT_TYPE: &str = "application/json";

/// One planned request worth of queued items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    /// Items taken from the head of the queue.
    pub count: usize,
    /// Request body length, inter-item newlines included in bulk mode.
    pub total: usize,
}

/// Bounded FIFO of outbound payloads with the pending-prefix
/// discipline: the first `pending` items have been handed to the
/// transport and must stay in place until acknowledged.
#[derive(Debug)]
pub struct MimeQueue {
    items: VecDeque<MimeItem>,
    queue_size: usize,
    pending: usize,
    /// Bulk batching cap; 0 selects one request per item.
    bulk_max_size: usize,
    /// Soft cap on total queued bytes; exceeding it drains.
    queue_max_size: usize,
    bulk_content_type: Cow<'static, str>,
    drainfilename: Option<String>,
}

impl MimeQueue {
    pub fn new(bulk_max_size: usize, queue_max_size: usize, drainfilename: Option<String>) -> Self {
        Self {
            items: VecDeque::new(),
            queue_size: 0,
            pending: 0,
            bulk_max_size,
            queue_max_size,
            bulk_content_type: Cow::Borrowed(DEFAULT_BULK_CONTENT_TYPE),
            drainfilename,
        }
    }

    pub fn set_bulk_content_type(&mut self, content_type: impl Into<Cow<'static, str>>) {
        self.bulk_content_type = content_type.into();
    }

    /// Reload-time parameter update; queued items are kept.
    pub fn reconfigure(
        &mut self,
        bulk_max_size: usize,
        queue_max_size: usize,
        drainfilename: Option<String>,
    ) {
        self.bulk_max_size = bulk_max_size;
        self.queue_max_size = queue_max_size;
        self.drainfilename = drainfilename;
    }

    /// Appends one item. When the soft cap would be exceeded the
    /// non-pending backlog is drained first; items too large for a
    /// single bulk request are rejected.
    pub fn enqueue(&mut self, item: MimeItem) -> Result<(), Error> {
        if self.bulk_max_size != 0 && item.len() > self.bulk_max_size - 1 {
            return Err(Error::Overflow { len: item.len(), max: self.bulk_max_size - 1 });
        }
        if self.queue_size + item.len() > self.queue_max_size {
            let queued_before = self.queue_size;
            let dropped = self.drain();
            warn!(
                queued_before,
                error = %Error::QueueOverflow { dropped },
                "backlog queue drained"
            );
        }
        self.queue_size += item.len();
        self.items.push_back(item);
        Ok(())
    }

    /// Drops every non-pending item, appending each plus a newline to
    /// the dated drain file when one is configured. Returns the bytes
    /// dropped.
    pub fn drain(&mut self) -> usize {
        if self.items.len() <= self.pending {
            return 0;
        }
        let tail = self.items.split_off(self.pending);
        let dropped: usize = tail.iter().map(MimeItem::len).sum();
        self.queue_size -= dropped;

        if let Some(template) = &self.drainfilename {
            let path = filedate(template);
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(mut file) => {
                    for item in &tail {
                        let _ = file.write_all(item.data());
                        let _ = file.write_all(b"\n");
                    }
                }
                Err(e) => warn!(path = %path, error = %e, "cannot open drain file"),
            }
        }
        dropped
    }

    /// Plans the next request without touching the queue. `None` when
    /// nothing is queued or nothing fits under the bulk cap.
    pub fn next_batch(&self) -> Option<Batch> {
        if self.bulk_max_size != 0 {
            let mut total = 0;
            let mut count = 0;
            for item in &self.items {
                // one more for the joining newline
                if total + item.len() + 1 > self.bulk_max_size {
                    break;
                }
                total += item.len() + 1;
                count += 1;
            }
            (count > 0).then_some(Batch { count, total })
        } else {
            self.items.front().map(|item| Batch { count: 1, total: item.len() })
        }
    }

    pub fn is_bulk(&self) -> bool {
        self.bulk_max_size != 0
    }

    pub fn bulk_content_type(&self) -> &str {
        &self.bulk_content_type
    }

    /// The first `n` queued items, oldest first.
    pub fn head(&self, n: usize) -> impl Iterator<Item = &MimeItem> {
        self.items.iter().take(n)
    }

    /// Marks the first `n` items as handed to the transport.
    pub fn note_pending(&mut self, n: usize) {
        self.pending += n;
        debug_assert!(self.pending <= self.items.len());
    }

    /// Frees exactly the pending prefix. Returns the bytes released.
    pub fn ack_pending(&mut self) -> usize {
        let mut released = 0;
        while self.pending != 0 {
            let Some(item) = self.items.pop_front() else { break };
            released += item.len();
            self.queue_size -= item.len();
            self.pending -= 1;
        }
        assert_eq!(self.pending, 0);
        released
    }

    /// Forgets the hand-off without freeing anything; used when the
    /// connection dies before the batch was acknowledged.
    pub fn reset_pending(&mut self) {
        self.pending = 0;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    pub fn pending(&self) -> usize {
        self.pending
    }
}
