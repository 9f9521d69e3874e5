//! Log capture for launched resources.

use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

/// Lines of output from a resource
pub type LogStream = BoxStream<'static, String>;

const HISTORY_LINES: usize = 1000;

#[derive(Default)]
struct LogState {
    history: VecDeque<String>,
    closed: bool,
    subscribers: Vec<async_channel::Sender<String>>,
}

/// Bounded log history with live subscribers.
///
/// Output is drained continuously, so a resource never blocks on a full
/// pipe even when nobody is reading its logs.
#[derive(Clone, Default)]
pub struct LogBuffer {
    state: Arc<Mutex<LogState>>,
}

impl LogBuffer {
    /// Empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line
    pub fn push(&self, line: String) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.history.len() == HISTORY_LINES {
            state.history.pop_front();
        }
        state.history.push_back(line.clone());
        state
            .subscribers
            .retain(|subscriber| subscriber.try_send(line.clone()).is_ok());
    }

    /// Mark the output as finished; live streams end
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        state.subscribers.clear();
    }

    /// History followed by live lines until the buffer is closed
    pub fn subscribe(&self) -> LogStream {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let history = stream::iter(state.history.clone());
        if state.closed {
            return history.boxed();
        }
        let (tx, rx) = async_channel::unbounded();
        state.subscribers.push(tx);
        history.chain(rx).boxed()
    }

    /// Drain `lines` into the buffer on a dedicated thread, closing the
    /// buffer when the stream ends
    pub fn pump<S>(&self, name: &str, lines: S) -> std::io::Result<()>
    where
        S: Stream<Item = String> + Send + 'static,
    {
        let buffer = self.clone();
        thread::Builder::new()
            .name(format!("{name}-logs"))
            .spawn(move || {
                async_io::block_on(async move {
                    let mut lines = std::pin::pin!(lines);
                    while let Some(line) = lines.next().await {
                        buffer.push(line);
                    }
                    buffer.close();
                })
            })?;
        Ok(())
    }
}
