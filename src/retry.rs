// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Policy
//!
//! Decides how a processed delivery is settled. The decision depends only on
//! what happened to the message, how many times it was retried already and
//! the retry budget:
//!
//! | processing result          | retries left | requeue on failure | outcome       |
//! |----------------------------|--------------|--------------------|---------------|
//! | handled                    | any          | any                | `Ack`         |
//! | undecodable payload        | any          | any                | `NackDiscard` |
//! | permanent handler error    | any          | any                | `NackDiscard` |
//! | transient handler error    | yes          | true               | `NackRequeue` |
//! | transient handler error    | yes          | false              | `NackDiscard` |
//! | transient handler error    | no           | any                | `NackDiscard` |

use crate::{configs::ConsumerConfigs, errors::HandlerError, message::Message};

/// How a delivery is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Acknowledge; the message is done.
    Ack,
    /// Republish with an incremented retry count, then ack the original it replaces.
    NackRequeue,
    /// Reject without requeue; the broker dead-letters it when the queue has a DLX.
    NackDiscard,
}

/// What happened when the engine tried to process a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    Handled,
    Failed(HandlerError),
    /// The payload could not be decoded; the handler never ran.
    Undecodable(String),
}

/// Where a message is republished for its next attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RepublishRoute {
    /// The exchange and routing key it was delivered with.
    #[default]
    Original,
    /// Straight to the consuming queue through the default exchange, so other
    /// queues bound to the same key do not receive a copy.
    Queue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub requeue_on_failure: bool,
    pub republish: RepublishRoute,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&ConsumerConfigs::default())
    }
}

impl From<&ConsumerConfigs> for RetryPolicy {
    fn from(cfg: &ConsumerConfigs) -> Self {
        RetryPolicy {
            max_retries: cfg.max_retries,
            requeue_on_failure: cfg.requeue_on_failure,
            republish: RepublishRoute::Original,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            requeue_on_failure: true,
            republish: RepublishRoute::Original,
        }
    }

    pub fn republish_to_queue(mut self) -> Self {
        self.republish = RepublishRoute::Queue;
        self
    }

    pub fn requeue_on_failure(mut self, requeue: bool) -> Self {
        self.requeue_on_failure = requeue;
        self
    }

    /// The retry budget for `msg`: its `maxRetries` header, else this policy's.
    pub fn max_retries_for(&self, msg: &Message) -> u32 {
        msg.max_retries().unwrap_or(self.max_retries)
    }

    pub fn decide(
        &self,
        result: &ProcessingResult,
        retry_count: u32,
        max_retries: u32,
    ) -> DeliveryOutcome {
        match result {
            ProcessingResult::Handled => DeliveryOutcome::Ack,
            ProcessingResult::Undecodable(_) => DeliveryOutcome::NackDiscard,
            ProcessingResult::Failed(err) if err.is_permanent() => DeliveryOutcome::NackDiscard,
            ProcessingResult::Failed(_)
                if self.requeue_on_failure && retry_count < max_retries =>
            {
                DeliveryOutcome::NackRequeue
            }
            ProcessingResult::Failed(_) => DeliveryOutcome::NackDiscard,
        }
    }
}
