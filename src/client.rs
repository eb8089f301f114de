// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Client
//!
//! Explicitly constructed entry point owning the broker connection, the
//! lifecycle event bus and every channel handed out. There is no process-wide
//! instance: create one with [`MessagingClient::open`] (RabbitMQ) or
//! [`MessagingClient::with_source`] (any [`ChannelSource`], e.g. the in-memory
//! broker), pass it by reference and [`close`](MessagingClient::close) it.
//!
//! ```no_run
//! use rabbitmq_reliable::{client::MessagingClient, configs::Configs};
//!
//! # async fn run() -> Result<(), rabbitmq_reliable::errors::AmqpError> {
//! let client = MessagingClient::open(Configs::load()?).await?;
//! // declare topology, publish, register handlers...
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    channel::AmqpConnection,
    configs::Configs,
    dispatcher::{RabbitMQDispatcher, Subscriptions},
    errors::AmqpError,
    events::EventBus,
    memory::InMemoryBroker,
    publisher::RabbitMQPublisher,
    topology::AmqpTopology,
    transport::Transport,
};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Something channels can be opened on.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    async fn open_transport(&self) -> Result<Arc<dyn Transport>, AmqpError>;

    /// Tears down the underlying connection once every channel is closed.
    async fn close(&self) -> Result<(), AmqpError>;
}

#[async_trait]
impl ChannelSource for AmqpConnection {
    async fn open_transport(&self) -> Result<Arc<dyn Transport>, AmqpError> {
        Ok(Arc::new(self.open_channel().await?))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        AmqpConnection::close(self).await
    }
}

#[async_trait]
impl ChannelSource for InMemoryBroker {
    async fn open_transport(&self) -> Result<Arc<dyn Transport>, AmqpError> {
        Ok(Arc::new(self.channel()))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        Ok(())
    }
}

pub struct MessagingClient {
    cfg: Configs,
    source: Arc<dyn ChannelSource>,
    events: Arc<EventBus>,
    control: Arc<dyn Transport>,
    publisher: Arc<RabbitMQPublisher>,
    transports: Mutex<Vec<Arc<dyn Transport>>>,
    subscriptions: Subscriptions,
    closed: AtomicBool,
}

impl MessagingClient {
    /// Connects to RabbitMQ as configured in `cfg.rabbitmq`.
    pub async fn open(cfg: Configs) -> Result<MessagingClient, AmqpError> {
        let conn = AmqpConnection::connect(&cfg).await?;
        Self::with_source(cfg, Arc::new(conn)).await
    }

    /// Builds a client on top of an already established source.
    ///
    /// One channel is opened right away for publishing and topology
    /// declarations; dispatchers get their own.
    pub async fn with_source(
        cfg: Configs,
        source: Arc<dyn ChannelSource>,
    ) -> Result<MessagingClient, AmqpError> {
        let control = source.open_transport().await?;
        let publisher = RabbitMQPublisher::new(control.clone(), cfg.rabbitmq.operation_timeout());
        let events = Arc::new(EventBus::new(cfg.app.event_capacity, cfg.app.event_history));

        debug!(name = cfg.app.name.as_str(), "messaging client opened");

        Ok(MessagingClient {
            cfg,
            source,
            events,
            control,
            publisher,
            transports: Mutex::new(vec![]),
            subscriptions: Subscriptions::default(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn configs(&self) -> &Configs {
        &self.cfg
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn publisher(&self) -> Result<Arc<RabbitMQPublisher>, AmqpError> {
        self.ensure_open()?;
        Ok(self.publisher.clone())
    }

    /// A topology builder declaring through the client's control channel.
    pub fn topology(&self) -> Result<AmqpTopology, AmqpError> {
        self.ensure_open()?;
        Ok(AmqpTopology::new(
            self.control.clone(),
            self.cfg.rabbitmq.operation_timeout(),
        ))
    }

    /// A dispatcher on a fresh channel. Its subscriptions are cancelled on close.
    pub async fn dispatcher(&self) -> Result<RabbitMQDispatcher, AmqpError> {
        self.ensure_open()?;
        let transport = self.source.open_transport().await?;

        self.transports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(transport.clone());

        Ok(
            RabbitMQDispatcher::new(transport, self.events.clone(), &self.cfg)
                .tracked(self.subscriptions.clone()),
        )
    }

    /// Stops consuming, flushes outstanding acks/nacks and closes the connection.
    ///
    /// Subscriptions are cancelled first and their in-flight messages are
    /// given until `rabbitmq.drain_timeout_ms` to finish and be settled.
    /// Deliveries still unsettled at that deadline, including those of
    /// handlers that never return, are reported as [`AmqpError::CloseError`].
    /// The connection is closed either way. Closing a closed client does nothing.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("closing messaging client...");
        let drain_timeout = self.cfg.rabbitmq.drain_timeout();
        let deadline = Instant::now() + drain_timeout;

        if tokio::time::timeout(drain_timeout, self.subscriptions.cancel_all())
            .await
            .is_err()
        {
            warn!("in-flight messages still running after the drain timeout");
        }

        let mut transports: Vec<Arc<dyn Transport>> = self
            .transports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        transports.push(self.control.clone());

        let remaining = deadline.saturating_duration_since(Instant::now());
        let results = join_all(transports.iter().map(|t| t.close(remaining))).await;

        let mut unsettled = 0;
        let mut failure = None;
        for result in results {
            match result {
                Ok(()) => {}
                Err(AmqpError::CloseError(pending)) => unsettled += pending,
                Err(err) => {
                    error!(error = err.to_string(), "failure to close channel");
                    failure.get_or_insert(err);
                }
            }
        }

        self.source.close().await?;

        if unsettled > 0 {
            error!(unsettled, "client closed with unsettled deliveries");
            return Err(AmqpError::CloseError(unsettled));
        }

        match failure {
            Some(err) => Err(err),
            None => {
                debug!("messaging client closed");
                Ok(())
            }
        }
    }

    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::Closed);
        }
        Ok(())
    }
}
