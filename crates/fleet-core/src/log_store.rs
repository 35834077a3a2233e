//! Broadcast + history log store for job output.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use futures::{StreamExt, future};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Default history size limit (1 MB).
pub const DEFAULT_HISTORY_BYTES: usize = 1024 * 1024;

/// One chunk of job output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub chunk_id: u32,
    pub data: Vec<u8>,
    /// Set on the final chunk.
    pub last: bool,
}

struct Inner {
    history: VecDeque<LogChunk>,
    total_bytes: usize,
    finished: bool,
}

/// Log store with broadcast and history support.
///
/// Late readers receive the retained history, then follow live chunks.
/// History is trimmed from the front once it exceeds its byte budget.
pub struct LogStore {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<LogChunk>,
    history_bytes: usize,
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_BYTES)
    }
}

impl LogStore {
    /// Create a log store keeping at most `history_bytes` of history.
    #[must_use]
    pub fn new(history_bytes: usize) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
                finished: false,
            }),
            sender,
            history_bytes,
        }
    }

    /// Push a chunk to both live listeners and history.
    ///
    /// Chunks arriving after the last one are ignored.
    pub fn push(&self, chunk: LogChunk) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.finished {
            tracing::debug!(chunk_id = chunk.chunk_id, "Ignoring log chunk after last chunk");
            return;
        }

        let bytes = chunk.data.len();
        while inner.total_bytes.saturating_add(bytes) > self.history_bytes {
            if let Some(front) = inner.history.pop_front() {
                inner.total_bytes = inner.total_bytes.saturating_sub(front.data.len());
            } else {
                break;
            }
        }
        inner.finished = chunk.last;
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
        inner.history.push_back(chunk.clone());

        // Sent under the lock so a concurrent `follow` never misses or repeats a chunk.
        let _ = self.sender.send(chunk);
    }

    /// End the log with an empty last chunk, unless it already ended.
    pub fn finish(&self) {
        let next_id = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            if inner.finished {
                return;
            }
            inner.history.back().map_or(0, |c| c.chunk_id.saturating_add(1))
        };
        self.push(LogChunk {
            chunk_id: next_id,
            data: Vec::new(),
            last: true,
        });
    }

    /// Whether the last chunk has been received.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .finished
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn history(&self) -> Vec<LogChunk> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .cloned()
            .collect()
    }

    /// Concatenated bytes of the retained history.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .flat_map(|c| c.data.iter().copied())
            .collect()
    }

    /// Stream that yields history first, then live chunks, ending after the last chunk.
    #[must_use]
    pub fn follow(&self) -> futures::stream::BoxStream<'static, LogChunk> {
        let (history, rx, finished) = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            let history: Vec<LogChunk> = inner.history.iter().cloned().collect();
            (history, self.sender.subscribe(), inner.finished)
        };

        let hist = futures::stream::iter(history);
        if finished {
            return hist.boxed();
        }

        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });
        let mut done = false;
        hist.chain(live)
            .take_while(move |chunk| {
                let keep = !done;
                done = chunk.last;
                future::ready(keep)
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn chunk(id: u32, data: &str, last: bool) -> LogChunk {
        LogChunk {
            chunk_id: id,
            data: data.as_bytes().to_vec(),
            last,
        }
    }

    #[test]
    fn test_history_is_trimmed_to_budget() {
        let store = LogStore::new(8);
        store.push(chunk(0, "aaaa", false));
        store.push(chunk(1, "bbbb", false));
        store.push(chunk(2, "cccc", false));

        let ids: Vec<u32> = store.history().iter().map(|c| c.chunk_id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(store.contents(), b"bbbbcccc");
    }

    #[test]
    fn test_chunks_after_last_are_ignored() {
        let store = LogStore::default();
        store.push(chunk(0, "done", true));
        store.push(chunk(1, "late", false));
        assert!(store.is_finished());
        assert_eq!(store.history().len(), 1);
    }

    #[tokio::test]
    async fn test_finish_ends_followers() {
        let store = LogStore::default();
        store.push(chunk(4, "partial", false));
        let follower = store.follow();

        store.finish();
        store.finish();

        let got: Vec<(u32, bool)> = follower.map(|c| (c.chunk_id, c.last)).collect().await;
        assert_eq!(got, vec![(4, false), (5, true)]);
    }

    #[tokio::test]
    async fn test_follower_waits_for_live_chunks() {
        let store = LogStore::default();
        let mut follower = tokio_test::task::spawn(store.follow());

        tokio_test::assert_pending!(follower.poll_next());
        store.push(chunk(0, "late", false));
        assert!(follower.is_woken());
        tokio_test::assert_ready_eq!(follower.poll_next(), Some(chunk(0, "late", false)));
        tokio_test::assert_pending!(follower.poll_next());
    }

    #[tokio::test]
    async fn test_follow_replays_history_then_live_until_last() {
        let store = std::sync::Arc::new(LogStore::default());
        store.push(chunk(0, "one\n", false));

        let follower = store.follow();
        store.push(chunk(1, "two\n", false));
        store.push(chunk(2, "three\n", true));

        let got: Vec<u32> = follower.map(|c| c.chunk_id).collect().await;
        assert_eq!(got, vec![0, 1, 2]);
    }
}
