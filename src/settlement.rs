// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Settlement Ledger
//!
//! Tracks which delivery tags of a channel are still awaiting an ack or nack.
//! Delivery tags are handed out in increasing order per channel, so a tag at
//! or below the highest tracked tag that is no longer pending must already
//! have been settled.

use crate::errors::AmqpError;
use std::{
    collections::BTreeSet,
    sync::Mutex,
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, error};

#[derive(Debug, Default)]
struct Ledger {
    pending: BTreeSet<u64>,
    highest: u64,
}

#[derive(Debug, Default)]
pub struct Settlements {
    ledger: Mutex<Ledger>,
    drained: Notify,
}

impl Settlements {
    pub fn new() -> Settlements {
        Settlements::default()
    }

    /// Records a freshly delivered tag.
    pub fn track(&self, delivery_tag: u64) {
        let mut ledger = self.lock();
        ledger.pending.insert(delivery_tag);
        ledger.highest = ledger.highest.max(delivery_tag);
    }

    /// Marks a tag as settled, failing if it was settled before or never delivered.
    pub fn settle(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut ledger = self.lock();

        if ledger.pending.remove(&delivery_tag) {
            if ledger.pending.is_empty() {
                self.drained.notify_waiters();
            }
            return Ok(());
        }

        let err = if delivery_tag != 0 && delivery_tag <= ledger.highest {
            AmqpError::already_settled(delivery_tag)
        } else {
            AmqpError::unknown_delivery(delivery_tag)
        };

        error!(error = err.to_string(), "ack protocol violation");
        Err(err)
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Waits until every tracked delivery is settled, or fails with [`AmqpError::CloseError`].
    pub async fn drained(&self, limit: Duration) -> Result<(), AmqpError> {
        let deadline = Instant::now() + limit;

        loop {
            let notified = self.drained.notified();

            let pending = self.pending();
            if pending == 0 {
                return Ok(());
            }

            debug!(pending, "waiting for in-flight deliveries to settle");
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let pending = self.pending();
                if pending == 0 {
                    return Ok(());
                }
                error!(pending, "deliveries left unsettled");
                return Err(AmqpError::CloseError(pending));
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ledger> {
        // The ledger holds plain data; a poisoned lock still contains a consistent set.
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn settles_each_tag_exactly_once() {
        let ledger = Settlements::new();
        ledger.track(1);
        ledger.track(2);

        assert!(ledger.settle(2).is_ok());
        assert_eq!(ledger.pending(), 1);
        assert_eq!(ledger.settle(2), Err(AmqpError::already_settled(2)));
        assert!(ledger.settle(1).is_ok());
        assert_eq!(ledger.pending(), 0);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let ledger = Settlements::new();
        ledger.track(1);

        assert_eq!(ledger.settle(7), Err(AmqpError::unknown_delivery(7)));
        assert_eq!(ledger.settle(0), Err(AmqpError::unknown_delivery(0)));
        assert_eq!(ledger.pending(), 1);
    }

    #[tokio::test]
    async fn drained_returns_immediately_when_idle() {
        let ledger = Settlements::new();
        assert!(ledger.drained(Duration::from_millis(1)).await.is_ok());
    }

    #[tokio::test]
    async fn drained_wakes_when_last_delivery_settles() {
        let ledger = Arc::new(Settlements::new());
        ledger.track(1);

        let settler = ledger.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            settler.settle(1).unwrap();
        });

        assert!(ledger.drained(Duration::from_secs(5)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn drained_times_out_with_pending_count() {
        let ledger = Settlements::new();
        ledger.track(1);
        ledger.track(2);

        assert_eq!(
            ledger.drained(Duration::from_millis(100)).await,
            Err(AmqpError::CloseError(2))
        );
    }
}
