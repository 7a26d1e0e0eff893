//! Reattachable SSE log sessions for long-running operations (e.g. domain tunnel start).
//! The operation runs server-side under an opaque session id while its log lines are
//! buffered; a client that drops the stream can reattach with
//! `?session_id=<id>&log_index=<k>` and receives the suffix from index k. Finished
//! sessions are released after a grace period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::stream::Stream;
use tokio::sync::watch;

/// How long a finished session stays reattachable before it is dropped.
const RELEASE_AFTER: Duration = Duration::from_secs(600);

/// One buffered operation log. Producers push lines and finish; consumers stream from any
/// index, live until the line after `finish`.
pub struct LogSession {
    pub id: String,
    lines: RwLock<Vec<String>>,
    done: AtomicBool,
    version: watch::Sender<u64>,
}

impl LogSession {
    fn new() -> Arc<Self> {
        let (version, _) = watch::channel(0);
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            lines: RwLock::new(Vec::new()),
            done: AtomicBool::new(false),
            version,
        })
    }

    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lines.write().expect("session lock");
        lines.push(line.into());
        let len = lines.len() as u64;
        drop(lines);
        self.version.send_replace(len);
    }

    /// Mark the operation complete and wake all streams so they can emit `done`.
    pub fn finish(&self) {
        self.done.store(true, Ordering::SeqCst);
        let len = self.lines.read().expect("session lock").len() as u64;
        self.version.send_replace(len + 1);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn line_at(&self, index: usize) -> Option<String> {
        self.lines.read().expect("session lock").get(index).cloned()
    }

    /// Items of the stream: buffered lines from `from` onwards, then live lines, then a
    /// final `None`-terminating marker once the session is finished.
    pub fn stream_from(self: &Arc<Self>, from: usize) -> impl Stream<Item = String> {
        let session = Arc::clone(self);
        let rx = session.version.subscribe();
        futures_util::stream::unfold((session, from, rx), |(session, mut idx, mut rx)| async move {
            loop {
                if let Some(line) = session.line_at(idx) {
                    idx += 1;
                    return Some((line, (session, idx, rx)));
                }
                if session.is_done() {
                    return None;
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        })
    }
}

/// Registry of live sessions, keyed by id.
#[derive(Default)]
pub struct LogSessions {
    sessions: DashMap<String, Arc<LogSession>>,
}

impl LogSessions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a session and schedule its release for after it finishes.
    pub fn create(self: &Arc<Self>) -> Arc<LogSession> {
        let session = LogSession::new();
        self.sessions.insert(session.id.clone(), session.clone());
        let registry = Arc::clone(self);
        let id = session.id.clone();
        let watched = session.clone();
        tokio::spawn(async move {
            let mut rx = watched.version.subscribe();
            while !watched.is_done() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
            tokio::time::sleep(RELEASE_AFTER).await;
            registry.sessions.remove(&id);
        });
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<LogSession>> {
        self.sessions.get(id).map(|s| s.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn stream_sees_buffered_and_live_lines() {
        let sessions = LogSessions::new();
        let session = sessions.create();
        session.push("one");
        session.push("two");

        let mut stream = Box::pin(session.stream_from(0));
        assert_eq!(stream.next().await.as_deref(), Some("one"));
        assert_eq!(stream.next().await.as_deref(), Some("two"));

        session.push("three");
        assert_eq!(stream.next().await.as_deref(), Some("three"));
        session.finish();
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn reattach_from_index_gets_suffix_only() {
        let sessions = LogSessions::new();
        let session = sessions.create();
        for i in 0..5 {
            session.push(format!("line {}", i));
        }
        session.finish();

        let found = sessions.get(&session.id).expect("session still registered");
        let collected: Vec<String> = found.stream_from(3).collect().await;
        assert_eq!(collected, vec!["line 3".to_string(), "line 4".to_string()]);
    }

    #[tokio::test]
    async fn unknown_session_is_absent() {
        let sessions = LogSessions::new();
        assert!(sessions.get("nope").is_none());
    }
}
