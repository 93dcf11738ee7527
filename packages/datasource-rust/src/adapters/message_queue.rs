//! Message-queue adapter over an in-process buffer.
//!
//! Messages published to the broker side pass through a per-adapter consumer
//! task, which moves them into an unbounded buffer. Reads poll that buffer
//! with a timeout.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use apex_data_core::{
    ConnectionStatus, DataSourceConfiguration, DataSourceError, DataSourceMetrics, DataSourceType,
    Params, Record, Result, Value,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use super::AdapterCore;
use crate::traits::ExternalDataSource;
use crate::worker::{BackgroundRunnable, BackgroundWorker, WorkerSchedule};

const SINGLE_POLL_TIMEOUT: Duration = Duration::from_millis(1000);
const BATCH_POLL_TIMEOUT: Duration = Duration::from_millis(5000);
const DEFAULT_MAX_MESSAGES: usize = 10;
const CONSUMER_GRACE: Duration = Duration::from_secs(5);
const CONSUMER_HEARTBEAT: Duration = Duration::from_secs(60);

/// Broker technology a queue adapter fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerFamily {
    Kafka,
    RabbitMq,
    ActiveMq,
    InMemory,
}

impl BrokerFamily {
    /// Parses a `source-type`; the bare category value means in-memory.
    #[must_use]
    pub fn from_source_type(source_type: &str) -> Option<Self> {
        match source_type.trim().to_ascii_lowercase().as_str() {
            "kafka" => Some(Self::Kafka),
            "rabbitmq" | "amqp" => Some(Self::RabbitMq),
            "activemq" | "jms" => Some(Self::ActiveMq),
            "in-memory" | "memory" | "message-queue" => Some(Self::InMemory),
            _ => None,
        }
    }
}

impl fmt::Display for BrokerFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Kafka => "kafka",
            Self::RabbitMq => "rabbitmq",
            Self::ActiveMq => "activemq",
            Self::InMemory => "in-memory",
        })
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

struct QueueConsumer {
    source: String,
    broker: BrokerFamily,
    buffer: mpsc::UnboundedSender<Value>,
    pending: Arc<AtomicUsize>,
}

#[async_trait]
impl BackgroundRunnable for QueueConsumer {
    type Task = Value;

    async fn run(&mut self, message: Value) {
        // Counted before the send so a reader never decrements below zero.
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.buffer.send(message).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(source = %self.source, broker = %self.broker, "buffer closed; message dropped");
        }
    }

    async fn on_tick(&mut self) {
        tracing::trace!(
            source = %self.source,
            broker = %self.broker,
            pending = self.pending.load(Ordering::SeqCst),
            "consumer heartbeat"
        );
    }
}

// ---------------------------------------------------------------------------
// MessageQueueDataSource
// ---------------------------------------------------------------------------

pub struct MessageQueueDataSource {
    core: AdapterCore,
    broker: RwLock<Option<BrokerFamily>>,
    sender: mpsc::UnboundedSender<Value>,
    receiver: Mutex<mpsc::UnboundedReceiver<Value>>,
    pending: Arc<AtomicUsize>,
    consumer: Mutex<Option<BackgroundWorker<QueueConsumer>>>,
}

impl MessageQueueDataSource {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            core: AdapterCore::new(),
            broker: RwLock::new(None),
            sender,
            receiver: Mutex::new(receiver),
            pending: Arc::new(AtomicUsize::new(0)),
            consumer: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn broker(&self) -> Option<BrokerFamily> {
        *self.broker.read()
    }

    /// Messages consumed but not yet read.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Hands `message` to the broker side; the consumer task moves it into
    /// the read buffer.
    ///
    /// # Errors
    ///
    /// `CONNECTION_ERROR` when the adapter is not running.
    pub async fn publish(&self, message: Value) -> Result<()> {
        self.core.ensure_operational("publish")?;
        let consumer = self.consumer.lock().await;
        let Some(worker) = consumer.as_ref() else {
            return Err(DataSourceError::connection("Message consumer is not running")
                .in_context(&self.core.name(), "publish"));
        };
        let size = message.to_plain_string().len() as u64;
        worker.submit(message).await.map_err(|e| {
            DataSourceError::connection(format!("Failed to publish message: {e}"))
                .in_context(&self.core.name(), "publish")
        })?;
        self.core.metrics().record_bytes_written(size);
        Ok(())
    }

    fn start_consumer(&self, config: &DataSourceConfiguration, broker: BrokerFamily) -> BackgroundWorker<QueueConsumer> {
        BackgroundWorker::start(
            format!("{broker}-consumer-{}", config.name),
            QueueConsumer {
                source: config.name.clone(),
                broker,
                buffer: self.sender.clone(),
                pending: Arc::clone(&self.pending),
            },
            WorkerSchedule::every(CONSUMER_HEARTBEAT),
        )
    }

    async fn stop_consumer(&self) {
        let running = self.consumer.lock().await.take();
        if let Some(mut worker) = running {
            if !worker.stop(CONSUMER_GRACE).await {
                tracing::warn!(source = %self.core.name(), "consumer aborted after grace period");
            }
        }
    }

    /// Waits up to `timeout` for one message.
    async fn poll_one(&self, timeout: Duration) -> Option<Value> {
        let mut receiver = self.receiver.lock().await;
        let message = tokio::time::timeout(timeout, receiver.recv()).await.ok().flatten()?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(message)
    }

    /// Collects up to `max` messages, waiting no longer than `timeout` overall.
    async fn poll_batch(&self, max: usize, timeout: Duration) -> Vec<Value> {
        let deadline = Instant::now() + timeout;
        let mut receiver = self.receiver.lock().await;
        let mut messages = Vec::new();
        while messages.len() < max {
            match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Ok(Some(message)) => {
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    messages.push(message);
                }
                Ok(None) | Err(_) => break,
            }
        }
        messages
    }
}

impl Default for MessageQueueDataSource {
    fn default() -> Self {
        Self::new()
    }
}

fn duration_param(value: Option<&Value>, default: Duration) -> Duration {
    value
        .and_then(Value::as_i64)
        .and_then(|ms| u64::try_from(ms).ok())
        .map_or(default, Duration::from_millis)
}

fn into_record(message: Value) -> Record {
    match message {
        Value::Map(map) => map,
        other => Record::from([("message".to_string(), other)]),
    }
}

#[async_trait]
impl ExternalDataSource for MessageQueueDataSource {
    fn configuration(&self) -> Arc<DataSourceConfiguration> {
        self.core.config()
    }

    fn source_type(&self) -> DataSourceType {
        DataSourceType::MessageQueue
    }

    fn metrics(&self) -> Arc<DataSourceMetrics> {
        self.core.metrics()
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.core.status()
    }

    async fn initialize(&self, config: &DataSourceConfiguration) -> Result<()> {
        self.core.set_config(config);
        self.core.begin_connect();

        let source_type = config.source_type_or_default();
        let Some(broker) = BrokerFamily::from_source_type(&source_type) else {
            let err = DataSourceError::configuration(format!(
                "Unsupported message queue type: {source_type}"
            ))
            .in_context(&config.name, "initialize");
            self.core.connect_failed(&err);
            return Err(err);
        };

        self.stop_consumer().await;
        let worker = self.start_consumer(config, broker);
        *self.consumer.lock().await = Some(worker);
        *self.broker.write() = Some(broker);

        self.core
            .connect_succeeded(&format!("Consuming from {broker}"));
        tracing::info!(
            source = %config.name,
            broker = %broker,
            topics = ?config.topics,
            "message queue data source initialized"
        );
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.core.set_status(ConnectionStatus::shutting_down());
        self.stop_consumer().await;

        let mut drained = 0usize;
        {
            let mut receiver = self.receiver.lock().await;
            while receiver.try_recv().is_ok() {
                drained += 1;
            }
        }
        self.pending.store(0, Ordering::SeqCst);
        self.core.set_status(ConnectionStatus::shutdown());
        tracing::debug!(source = %self.core.name(), drained, "message queue data source shut down");
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        self.core.status().is_operational() && self.test_connection().await
    }

    async fn test_connection(&self) -> bool {
        self.consumer
            .lock()
            .await
            .as_ref()
            .is_some_and(|worker| worker.is_running())
    }

    /// Polls one message; the first parameter, when an integer, overrides the
    /// timeout in milliseconds.
    async fn get_data(&self, _data_type: &str, params: &[Value]) -> Result<Option<Value>> {
        self.core.ensure_operational("get_data")?;
        let timeout = duration_param(params.first(), SINGLE_POLL_TIMEOUT);
        let message = self
            .core
            .timed("get_data", async { Ok::<_, DataSourceError>(self.poll_one(timeout).await) })
            .await?;
        if message.is_some() {
            self.core.metrics().record_records_processed(1);
        }
        Ok(message)
    }

    /// Collects up to `maxMessages` (default 10) within `timeout` ms
    /// (default 5000).
    async fn query(&self, _query: &str, params: &Params) -> Result<Vec<Record>> {
        self.core.ensure_operational("query")?;
        let max = params
            .get("maxMessages")
            .and_then(Value::as_i64)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(DEFAULT_MAX_MESSAGES);
        let timeout = duration_param(params.get("timeout"), BATCH_POLL_TIMEOUT);
        let messages = self
            .core
            .timed("query", async { Ok::<_, DataSourceError>(self.poll_batch(max, timeout).await) })
            .await?;
        self.core
            .metrics()
            .record_records_processed(messages.len() as u64);
        Ok(messages.into_iter().map(into_record).collect())
    }

    async fn batch_update(&self, statements: &[String]) -> Result<Vec<u64>> {
        let mut counts = Vec::with_capacity(statements.len());
        for statement in statements {
            self.publish(Value::from(statement.as_str())).await?;
            counts.push(1);
        }
        Ok(counts)
    }

    async fn refresh(&self) -> Result<()> {
        if self.test_connection().await {
            return Ok(());
        }
        let config = self.core.config();
        tracing::info!(source = %config.name, "restarting message consumer");
        self.initialize(&config).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
