use std::collections::HashMap;

use bytes::Bytes;

/// Optional properties attached to a published message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Advisory content type. Never interpreted by the broker or the bridge.
    pub content_type: Option<String>,

    /// Opaque token echoed back in a response.
    pub correlation_id: Option<String>,

    /// Free-form application headers.
    pub headers: HashMap<String, String>,

    /// Queue a responder should publish its response to.
    pub reply_to: Option<String>,
}

impl PublishOptions {
    /// Options for a request expecting a reply on `reply_to`.
    #[must_use]
    pub fn request(reply_to: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            reply_to: Some(reply_to.into()),
            ..Self::default()
        }
    }

    /// Options for a response tagged with `correlation_id`.
    #[must_use]
    pub fn response(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..Self::default()
        }
    }

    /// Sets the content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// A message as it travels through the broker.
///
/// Brokers clone messages when routing them to several queues but never
/// mutate them after publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Exchange the message was published to (`""` for the default exchange).
    pub exchange: String,

    /// Opaque payload.
    pub payload: Bytes,

    /// Properties supplied by the publisher.
    pub properties: PublishOptions,

    /// Routing key the message was published with.
    pub routing_key: String,
}

impl Message {
    /// Creates a new message.
    #[must_use]
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Bytes,
        properties: PublishOptions,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            payload,
            properties,
            routing_key: routing_key.into(),
        }
    }

    /// Correlation id, or `""` when absent.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        self.properties.correlation_id.as_deref().unwrap_or_default()
    }

    /// Reply-to address, or `""` when absent.
    #[must_use]
    pub fn reply_to(&self) -> &str {
        self.properties.reply_to.as_deref().unwrap_or_default()
    }

    /// Looks up a header.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.properties.headers.get(key).map(String::as_str)
    }
}
