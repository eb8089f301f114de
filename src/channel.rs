// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module handles the creation and management of AMQP connections and channels.
//! `AmqpConnection` owns the single connection of a client; every subscription and
//! the publisher get their own `AmqpChannel`, which implements [`Transport`] on top
//! of lapin with publisher confirms enabled.

use crate::{
    configs::Configs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::Message,
    queue::{QueueBinding, QueueDefinition},
    settlement::Settlements,
    transport::{Delivery, DeliveryStream, Transport},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    Channel, Connection, ConnectionProperties,
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// The single broker connection shared by a client.
pub struct AmqpConnection {
    conn: Connection,
    closed: AtomicBool,
}

impl AmqpConnection {
    /// Connects to RabbitMQ using the `rabbitmq` section of `cfg`.
    ///
    /// The connection is named after `cfg.app.name` so it can be identified in
    /// the management UI.
    pub async fn connect(cfg: &Configs) -> Result<AmqpConnection, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.app.name.clone()));

        let conn = match Connection::connect(&cfg.rabbitmq.uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        Ok(AmqpConnection {
            conn,
            closed: AtomicBool::new(false),
        })
    }

    /// Opens a new channel with publisher confirms enabled.
    pub async fn open_channel(&self) -> Result<AmqpChannel, AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::Closed);
        }

        debug!("creating amqp channel...");
        let channel = match self.conn.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }?;

        if let Err(err) = channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
        {
            error!(error = err.to_string(), "error to enable publisher confirms");
            return Err(AmqpError::ChannelError);
        }

        debug!("channel created");
        Ok(AmqpChannel::new(channel))
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.conn.status().connected()
    }

    /// Closes the connection. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("closing amqp connection...");
        match self.conn.close(REPLY_SUCCESS, "client closed").await {
            Err(err) => {
                error!(error = err.to_string(), "failure to close the connection");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
            _ => {
                debug!("amqp connection closed");
                Ok(())
            }
        }
    }
}

/// A lapin channel implementing [`Transport`].
///
/// Acks and nacks are issued by delivery tag on the channel that received the
/// delivery, after the settlement ledger confirms the tag is still outstanding.
pub struct AmqpChannel {
    channel: Channel,
    settlements: Arc<Settlements>,
    closed: AtomicBool,
}

impl AmqpChannel {
    fn new(channel: Channel) -> AmqpChannel {
        AmqpChannel {
            channel,
            settlements: Arc::new(Settlements::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::Closed);
        }
        Ok(())
    }
}

fn field_table(args: &BTreeMap<String, crate::message::HeaderValue>) -> FieldTable {
    let table: BTreeMap<ShortString, AMQPValue> = args
        .iter()
        .map(|(k, v)| (ShortString::from(k.clone()), AMQPValue::from(v)))
        .collect();

    FieldTable::from(table)
}

#[async_trait]
impl Transport for AmqpChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                field_table(&def.arguments()),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        msg: &Message,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let confirm = match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                msg.payload(),
                msg.amqp_properties(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            Ok(confirm) => Ok(confirm),
        }?;

        match confirm.await {
            Err(err) => {
                error!(error = err.to_string(), "error waiting publisher confirm");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            Ok(confirmation) if confirmation.is_nack() => {
                error!(message_id = msg.id(), "broker refused the message");
                Err(AmqpError::PublishingError("broker nacked the message".to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.settlements.settle(delivery_tag)?;

        match self
            .channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.settlements.settle(delivery_tag)?;

        match self
            .channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.ensure_open()?;

        match self
            .channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to configure qos");
                Err(AmqpError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;

        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let settlements = self.settlements.clone();
        let stream = consumer.map(move |result| match result {
            Ok(delivery) => {
                settlements.track(delivery.delivery_tag);
                Ok(Delivery {
                    delivery_tag: delivery.delivery_tag,
                    exchange: delivery.exchange.as_str().to_owned(),
                    routing_key: delivery.routing_key.as_str().to_owned(),
                    redelivered: delivery.redelivered,
                    message: Message::from_amqp(&delivery.properties, delivery.data),
                })
            }
            Err(err) => {
                error!(error = err.to_string(), "errors consume msg");
                Err(AmqpError::ConsumerError(err.to_string()))
            }
        });

        Ok(Box::pin(stream))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to cancel consumer");
                Err(AmqpError::ConsumerError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn pending_settlements(&self) -> usize {
        self.settlements.pending()
    }

    async fn close(&self, drain_timeout: Duration) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let drained = self.settlements.drained(drain_timeout).await;

        if let Err(err) = self.channel.close(REPLY_SUCCESS, "client closed").await {
            error!(error = err.to_string(), "failure to close the channel");
            drained?;
            return Err(AmqpError::ChannelError);
        }

        debug!("channel closed");
        drained
    }
}
