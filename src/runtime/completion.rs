//! Pending command completions, matched to replies in wire order.
//!
//! RESP has no correlation ids, so the queue is strictly FIFO. An entry
//! whose caller gave up (timeout or dropped future) keeps its slot with no
//! sender attached, so the reply that eventually arrives for it is consumed
//! and discarded instead of being handed to the next command.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::{ClientError, RespError, Result};
use crate::protocols::resp::response::RespResponse;

pub(crate) type CommandResult = std::result::Result<RespResponse, ClientError>;
pub(crate) type Completion = oneshot::Sender<CommandResult>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A command written to the wire and waiting for its reply.
#[derive(Debug)]
pub(crate) struct PendingCompletion {
    name: String,
    sender: Option<Completion>,
    deadline: Option<Instant>,
    generation: u64,
}

impl PendingCompletion {
    pub(crate) fn new(name: String, sender: Completion, deadline: Option<Instant>, generation: u64) -> Self {
        Self {
            name,
            sender: Some(sender),
            deadline,
            generation,
        }
    }

    /// Deliver `result` if the caller is still waiting.
    fn complete(&mut self, result: CommandResult) {
        if let Some(sender) = self.sender.take() {
            // The caller may have dropped its future in the meantime.
            let _ = sender.send(result);
        }
    }

    fn is_abandoned(&self) -> bool {
        self.sender.as_ref().map_or(true, |sender| sender.is_closed())
    }
}

/// A `SUBSCRIBE`-family command waiting for one ack per channel.
///
/// Acks arrive as pushes, so these never occupy a slot in the reply queue.
#[derive(Debug)]
pub(crate) struct PendingSubscription {
    kind: String,
    remaining: Vec<Bytes>,
    sender: Option<Completion>,
    generation: u64,
}

impl PendingSubscription {
    /// `channels` empty means "complete on the first ack of this kind",
    /// as for a bare `UNSUBSCRIBE`.
    pub(crate) fn new(command: &str, channels: Vec<Bytes>, sender: Completion, generation: u64) -> Self {
        Self {
            kind: command.to_ascii_lowercase(),
            remaining: channels,
            sender: Some(sender),
            generation,
        }
    }
}

#[derive(Default)]
struct Queues {
    replies: VecDeque<PendingCompletion>,
    subscriptions: VecDeque<PendingSubscription>,
}

/// FIFO of completions shared by the send loop, the receive loop and the
/// timeout sweep.
#[derive(Default)]
pub(crate) struct CompletionQueue {
    inner: Mutex<Queues>,
}

impl CompletionQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a command about to be written. Must happen before its
    /// bytes reach the socket.
    pub(crate) fn push(&self, pending: PendingCompletion) {
        trace!(command = %pending.name, "awaiting reply");
        lock(&self.inner).replies.push_back(pending);
    }

    pub(crate) fn push_subscription(&self, pending: PendingSubscription) {
        trace!(command = %pending.kind, channels = pending.remaining.len(), "awaiting subscription acks");
        lock(&self.inner).subscriptions.push_back(pending);
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.inner).replies.len()
    }

    /// Hand `result` to the oldest pending command.
    ///
    /// A reply with nothing pending means the stream is out of step with
    /// the commands, which is fatal.
    pub(crate) fn complete_next(&self, result: CommandResult) -> Result<()> {
        let pending = lock(&self.inner).replies.pop_front();
        match pending {
            Some(mut pending) => {
                if pending.sender.is_none() {
                    trace!(command = %pending.name, "discarding reply for abandoned command");
                }
                pending.complete(result);
                Ok(())
            }
            None => Err(RespError::format("reply received with no command pending")),
        }
    }

    /// Match a subscription ack against the oldest subscription waiting for
    /// it. Returns `false` if nothing was waiting, so the push can be routed
    /// elsewhere.
    pub(crate) fn acknowledge(&self, kind: &[u8], channel: &[u8], response: &RespResponse) -> bool {
        let mut queues = lock(&self.inner);
        let position = queues.subscriptions.iter().position(|pending| {
            pending.kind.as_bytes().eq_ignore_ascii_case(kind)
                && (pending.remaining.is_empty() || pending.remaining.iter().any(|c| c.as_ref() == channel))
        });
        let Some(index) = position else {
            return false;
        };

        let pending = &mut queues.subscriptions[index];
        if let Some(at) = pending.remaining.iter().position(|c| c.as_ref() == channel) {
            pending.remaining.swap_remove(at);
        }
        if pending.remaining.is_empty() {
            if let Some(mut done) = queues.subscriptions.remove(index) {
                if let Some(sender) = done.sender.take() {
                    let _ = sender.send(Ok(response.clone()));
                }
            }
        }
        true
    }

    /// Time out every pending command whose deadline is at or before
    /// `now`, and detach senders whose callers went away. Slots stay in
    /// place. Returns the number of commands timed out.
    pub(crate) fn expire(&self, now: Instant) -> usize {
        let mut expired = 0;
        let mut queues = lock(&self.inner);
        for pending in queues.replies.iter_mut() {
            if pending.sender.is_none() {
                continue;
            }
            if pending.deadline.map_or(false, |deadline| deadline <= now) {
                debug!(command = %pending.name, "command timed out waiting for reply");
                pending.complete(Err(ClientError::Timeout));
                expired += 1;
            } else if pending.is_abandoned() {
                pending.sender = None;
            }
        }
        expired
    }

    /// Fail every pending command and subscription of `generation` or
    /// older. Returns the number failed.
    pub(crate) fn fail_all(&self, generation: u64, error: impl Fn() -> ClientError) -> usize {
        let mut queues = lock(&self.inner);
        let mut failed = 0;
        while queues
            .replies
            .front()
            .map_or(false, |pending| pending.generation <= generation)
        {
            if let Some(mut pending) = queues.replies.pop_front() {
                pending.complete(Err(error()));
                failed += 1;
            }
        }
        let subscriptions = std::mem::take(&mut queues.subscriptions);
        for mut pending in subscriptions {
            if pending.generation > generation {
                queues.subscriptions.push_back(pending);
                continue;
            }
            if let Some(sender) = pending.sender.take() {
                let _ = sender.send(Err(error()));
            }
            failed += 1;
        }
        failed
    }
}
