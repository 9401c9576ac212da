use anyhow::{Error, Result, anyhow};
use lapin::{
    Channel, Connection, ConnectionProperties, Consumer,
    options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions, BasicRejectOptions, QueueDeclareOptions},
    types::FieldTable,
};
use tracing::info;

/// Consumer side of the inbound event queue.
pub struct RabbitMqClient {
    channel: Channel,
    events_queue_name: String,
}

impl RabbitMqClient {
    pub async fn connect(rabbitmq_url: &str, events_queue_name: &str, prefetch_count: u16) -> Result<Self, Error> {
        info!("Connecting to RabbitMQ...");

        let connection = Connection::connect(rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| anyhow!("RabbitMQ channel creation failed: {}", e))?;

        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to set up QoS: {}", e))?;

        channel
            .queue_declare(
                events_queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to declare events queue: {}", e))?;

        info!(queue = %events_queue_name, prefetch_count, "RabbitMQ events queue ready");

        Ok(Self {
            channel,
            events_queue_name: events_queue_name.to_string(),
        })
    }

    pub async fn create_consumer(&self) -> Result<Consumer, Error> {
        let consumer = self
            .channel
            .basic_consume(
                &self.events_queue_name,
                "push_fanout_worker",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to create consumer: {}", e))?;

        info!(queue = %self.events_queue_name, "Consumer created");

        Ok(consumer)
    }

    pub async fn acknowledge(&self, delivery_tag: u64) -> Result<(), Error> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to acknowledge message: {}", e))?;

        Ok(())
    }

    pub async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| anyhow!("Failed to reject message: {}", e))?;

        Ok(())
    }
}
