//! Per-channel cancellation bookkeeping.
//!
//! Every long-running operation (remote lookup, generation, chat turn, page
//! extraction) runs under a named [`Channel`]. Starting a new operation on a
//! channel cancels whatever was running there, so at most one handle per
//! channel is ever live. Cancellation is cooperative: operations race their
//! suspension points against the handle's token and report
//! [`Cancellable::Cancelled`] instead of failing.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    AiSummary,
    DatabaseQuery,
    Chat,
    DataExtraction,
    BookmarkCheck,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::AiSummary,
        Channel::DatabaseQuery,
        Channel::Chat,
        Channel::DataExtraction,
        Channel::BookmarkCheck,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Channel::AiSummary => "aiSummary",
            Channel::DatabaseQuery => "databaseQuery",
            Channel::Chat => "chat",
            Channel::DataExtraction => "dataExtraction",
            Channel::BookmarkCheck => "bookmarkCheck",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an operation that may have been superseded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cancellable<T> {
    Completed(T),
    Cancelled,
}

impl<T> Cancellable<T> {
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Token for one operation on one channel.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    channel: Channel,
    id: u64,
    token: CancellationToken,
}

impl ChannelHandle {
    #[must_use]
    pub const fn channel(&self) -> Channel {
        self.channel
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolves once the handle has been cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Drives `fut` unless the handle is cancelled first. Cancellation wins
    /// ties, and the future is dropped as soon as it loses.
    pub async fn run<F>(&self, fut: F) -> Cancellable<F::Output>
    where
        F: Future,
    {
        if self.token.is_cancelled() {
            return Cancellable::Cancelled;
        }
        tokio::select! {
            biased;
            () = self.token.cancelled() => Cancellable::Cancelled,
            out = fut => Cancellable::Completed(out),
        }
    }
}

#[derive(Debug, Default)]
pub struct CancellationRegistry {
    slots: Mutex<HashMap<Channel, ChannelHandle>>,
    next_id: AtomicU64,
}

impl CancellationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels whatever is live on `channel` and installs a fresh handle.
    pub fn begin(&self, channel: Channel) -> ChannelHandle {
        let handle = ChannelHandle {
            channel,
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            token: CancellationToken::new(),
        };

        let previous = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel, handle.clone());

        if let Some(previous) = previous {
            previous.token.cancel();
            debug!(channel = %channel, superseded = previous.id, "Cancelled previous operation");
        }
        debug!(channel = %channel, id = handle.id, "Began operation");
        handle
    }

    pub fn cancel(&self, channel: Channel) {
        let removed = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&channel);

        if let Some(handle) = removed {
            handle.token.cancel();
            debug!(channel = %channel, id = handle.id, "Cancelled operation");
        }
    }

    pub fn cancel_all(&self) {
        for channel in Channel::ALL {
            self.cancel(channel);
        }
        debug!("Cancelled all in-flight operations");
    }

    /// Releases the slot held by `handle` without signalling it. A slot that
    /// has since been taken by a newer operation is left alone.
    pub fn end(&self, handle: &ChannelHandle) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.get(&handle.channel).is_some_and(|live| live.id == handle.id) {
            slots.remove(&handle.channel);
            debug!(channel = %handle.channel, id = handle.id, "Ended operation");
        }
    }

    /// Id of the live handle on `channel`.
    #[must_use]
    pub fn current(&self, channel: Channel) -> Option<u64> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&channel)
            .map(ChannelHandle::id)
    }
}

/// Owns a spawned background loop. The loop is told to stop through the
/// token on `shutdown` or drop.
#[derive(Debug)]
pub struct TaskHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TaskHandle {
    #[must_use]
    pub fn new(cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Stops the loop and waits for it to exit.
    pub async fn shutdown(mut self) -> Result<(), JoinError> {
        self.cancel.cancel();
        match self.task.take() {
            Some(task) => match task.await {
                Ok(()) => Ok(()),
                Err(err) if err.is_cancelled() => Ok(()),
                Err(err) => Err(err),
            },
            None => Ok(()),
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
