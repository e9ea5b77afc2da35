use crate::connection::Client;
use crate::error::ConnError;
use crate::message::Message;

/// Subscription acknowledgement modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    #[default]
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    /// Value of the SUBSCRIBE `ack` header.
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }
}

/// A handle returned from [`Client::subscribe`].
///
/// Dropping the handle does not unsubscribe; call
/// [`unsubscribe`](Self::unsubscribe) for that. The subscription ends with its
/// session either way: subscriptions are not replayed after a reconnect.
#[derive(Clone)]
pub struct Subscription {
    id: String,
    destination: String,
    client: Client,
}

impl Subscription {
    pub(crate) fn new(id: String, destination: String, client: Client) -> Self {
        Self {
            id,
            destination,
            client,
        }
    }

    /// The subscription id sent in SUBSCRIBE.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Send UNSUBSCRIBE for this subscription. Messages that were already in
    /// flight for it are dropped.
    pub async fn unsubscribe(self, headers: Vec<(String, String)>) -> Result<(), ConnError> {
        self.client.unsubscribe(&self.id, headers).await
    }

    /// Acknowledge `message` on this subscription.
    pub async fn ack(&self, message: &Message) -> Result<(), ConnError> {
        let id = message
            .ack_id()
            .ok_or_else(|| ConnError::Protocol("MESSAGE carries no ack id".into()))?;
        self.client.ack(id, &self.id, Vec::new()).await
    }

    pub async fn nack(&self, message: &Message) -> Result<(), ConnError> {
        let id = message
            .ack_id()
            .ok_or_else(|| ConnError::Protocol("MESSAGE carries no ack id".into()))?;
        self.client.nack(id, &self.id, Vec::new()).await
    }
}
