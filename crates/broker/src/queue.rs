/// Declaration options for a queue.
///
/// Long-lived request queues are durable. Reply queues are exclusive,
/// auto-deleted and non-durable: they belong to one caller and disappear with
/// its last consumer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Delete the queue once its last consumer goes away.
    pub auto_delete: bool,

    /// Exchange that rejected (non-requeued) messages are republished to,
    /// keeping their original routing key.
    pub dead_letter_exchange: Option<String>,

    /// Survive a broker restart.
    pub durable: bool,

    /// Only usable by the declaring connection.
    pub exclusive: bool,
}

impl QueueOptions {
    /// A durable, shared queue.
    #[must_use]
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Self::default()
        }
    }

    /// An ephemeral reply queue.
    #[must_use]
    pub fn exclusive_auto_delete() -> Self {
        Self {
            auto_delete: true,
            exclusive: true,
            ..Self::default()
        }
    }

    /// Routes rejected messages to `exchange`.
    #[must_use]
    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}
