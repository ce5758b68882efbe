//! Reply dispatch for the receive path.
//!
//! Frames from the framer are folded into values, then routed: pushes to
//! subscription acks or the push channel, everything else to the oldest
//! pending command.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{trace, warn};

use super::completion::CompletionQueue;
use crate::error::{ClientError, Result};
use crate::protocols::resp::aggregate::{AggregatesPool, AggregationStrategy, RespFrame, RespValueVariant};
use crate::protocols::resp::response::{payload, RespPush, RespResponse, RespString, RespSubscriptionAck};
use crate::protocols::resp::types::RespType;

/// Routes completed values. Owned by the receive loop; not thread-safe.
pub(crate) struct ReplyDispatcher {
    strategy: AggregationStrategy,
    completions: Arc<CompletionQueue>,
    pushes: mpsc::Sender<RespPush>,
}

impl ReplyDispatcher {
    pub(crate) fn new(completions: Arc<CompletionQueue>, pushes: mpsc::Sender<RespPush>) -> Self {
        Self {
            strategy: AggregationStrategy::new(AggregatesPool::new()),
            completions,
            pushes,
        }
    }

    /// Feed one frame. Errors are fatal to the connection.
    pub(crate) fn handle(&mut self, frame: RespFrame) -> Result<()> {
        match self.strategy.aggregate(frame)? {
            Some(value) => self.dispatch(value),
            None => Ok(()),
        }
    }

    fn dispatch(&mut self, value: RespValueVariant) -> Result<()> {
        let attribute = self.strategy.take_attribute();
        if value.resp_type() == RespType::Push {
            if attribute.is_some() {
                trace!("dropping attribute attached to a push");
            }
            self.route_push(value);
            return Ok(());
        }

        let result = if value.is_error() {
            let message = RespString::new(value).to_string_lossy();
            trace!(%message, "error reply");
            Err(ClientError::Server(message))
        } else {
            Ok(RespResponse::with_attribute(value, attribute))
        };
        self.completions.complete_next(result)
    }

    fn route_push(&mut self, value: RespValueVariant) {
        if RespSubscriptionAck::can_convert(&value) {
            let response = RespResponse::new(value);
            let matched = match response.value.as_aggregate() {
                Some(push) => {
                    let kind = push.get(0).and_then(RespValueVariant::as_frame).map(payload);
                    let channel = push.get(1).and_then(RespValueVariant::as_frame).map(payload);
                    match (kind, channel) {
                        (Some(kind), Some(channel)) => self.completions.acknowledge(kind, channel, &response),
                        _ => false,
                    }
                }
                None => false,
            };
            if matched {
                return;
            }
            self.forward(response.value);
            return;
        }
        self.forward(value);
    }

    fn forward(&mut self, value: RespValueVariant) {
        let RespValueVariant::Aggregate(aggregate) = value else {
            return;
        };
        match self.pushes.try_send(RespPush::new(aggregate)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(push)) => {
                warn!(kind = ?push.kind(), "push channel full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("no push receiver, dropping message");
            }
        }
    }

    /// Drop partial aggregation state after the stream broke.
    pub(crate) fn reset(&mut self) {
        self.strategy.reset();
    }
}
