//! In-process message bus with subject routing.
//!
//! Messages are delivered to every subscription whose pattern matches the
//! subject. Subscriber queues are bounded; a full queue drops the message
//! rather than blocking the publisher. Request/reply rides on unique inbox
//! subjects.
use shared::message::Message;
use shared::subject;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// Queue depth for one subscription.
const SUBSCRIPTION_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Request timed out on {0}")]
    RequestTimeout(String),

    #[error("No responder on {0}")]
    NoResponder(String),

    #[error("Bus is closed")]
    Closed,
}

struct SubEntry {
    id: u64,
    pattern: String,
    tx: mpsc::Sender<Message>,
}

struct BusInner {
    subs: RwLock<Vec<SubEntry>>,
    next_sub: AtomicU64,
    next_inbox: AtomicU64,
}

/// The broker. Create once, hand [`BusConnection`]s to services.
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subs: RwLock::new(Vec::new()),
                next_sub: AtomicU64::new(1),
                next_inbox: AtomicU64::new(1),
            }),
        }
    }

    pub fn connection(&self) -> BusConnection {
        BusConnection {
            inner: self.inner.clone(),
        }
    }
}

/// A cheap handle onto the bus.
#[derive(Clone)]
pub struct BusConnection {
    inner: Arc<BusInner>,
}

impl BusConnection {
    /// Deliver `message` to every matching subscription. Returns how many
    /// queues accepted it.
    pub fn publish(&self, message: Message) -> usize {
        let mut delivered = 0;
        let mut stale = false;
        {
            let subs = self.inner.subs.read().expect("subs lock poisoned");
            for entry in subs.iter() {
                if !subject::matches(&entry.pattern, &message.subject) {
                    continue;
                }
                match entry.tx.try_send(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(
                            subject = %message.subject,
                            pattern = %entry.pattern,
                            "bus subscriber queue full, dropping message"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => stale = true,
                }
            }
        }
        if stale {
            self.inner
                .subs
                .write()
                .expect("subs lock poisoned")
                .retain(|entry| !entry.tx.is_closed());
        }
        delivered
    }

    /// Subscribe to a subject pattern (`*` and `>` wildcards supported).
    pub fn subscribe(&self, pattern: impl Into<String>) -> Subscription {
        let id = self.inner.next_sub.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_DEPTH);
        let pattern = pattern.into();
        self.inner
            .subs
            .write()
            .expect("subs lock poisoned")
            .push(SubEntry {
                id,
                pattern,
                tx,
            });
        Subscription {
            id,
            rx,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Publish a request and await the first reply.
    pub async fn request(
        &self,
        subject: impl Into<String>,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Message, BusError> {
        let subject = subject.into();
        let inbox = format!(
            "_inbox.{}",
            self.inner.next_inbox.fetch_add(1, Ordering::Relaxed)
        );
        let mut sub = self.subscribe(inbox.clone());

        let mut message = Message::new(subject.clone(), payload);
        message.reply = Some(inbox);
        if self.publish(message) == 0 {
            return Err(BusError::NoResponder(subject));
        }

        match tokio::time::timeout(timeout, sub.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::RequestTimeout(subject)),
        }
    }

    /// Reply to a request; a message without a reply inbox is ignored.
    pub fn respond(&self, request: &Message, payload: Vec<u8>) {
        if let Some(reply) = &request.reply {
            let mut message = Message::new(reply.clone(), payload);
            message.headers = request.headers.clone();
            self.publish(message);
        }
    }
}

/// One bounded subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Message>,
    inner: Weak<BusInner>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .subs
                .write()
                .expect("subs lock poisoned")
                .retain(|entry| entry.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_matching_subscriptions() {
        let bus = Bus::new();
        let conn = bus.connection();
        let mut host = conn.subscribe("powermgr.host.*.action");
        let mut all = conn.subscribe("powermgr.>");
        let mut other = conn.subscribe("thermalmgr.>");

        let delivered = conn.publish(Message::new("powermgr.host.0.action", vec![1]));
        assert_eq!(delivered, 2);
        assert_eq!(host.recv().await.unwrap().payload, vec![1]);
        assert_eq!(all.recv().await.unwrap().payload, vec![1]);
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let bus = Bus::new();
        let server = bus.connection();
        let client = bus.connection();

        let mut sub = server.subscribe("echo.req");
        tokio::spawn(async move {
            while let Some(msg) = sub.recv().await {
                server.respond(&msg, msg.payload.clone());
            }
        });

        let reply = client
            .request("echo.req", vec![7, 8, 9], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.payload, vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn request_without_responder_fails_fast() {
        let bus = Bus::new();
        let err = bus
            .connection()
            .request("nobody.home", Vec::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoResponder(_)));
    }

    #[tokio::test]
    async fn dropped_subscription_unsubscribes() {
        let bus = Bus::new();
        let conn = bus.connection();
        let sub = conn.subscribe("a.b");
        drop(sub);
        assert_eq!(conn.publish(Message::new("a.b", Vec::new())), 0);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let bus = Bus::new();
        let conn = bus.connection();
        let mut sub = conn.subscribe("flood");
        for _ in 0..SUBSCRIPTION_DEPTH + 10 {
            conn.publish(Message::new("flood", Vec::new()));
        }
        let mut received = 0;
        while sub.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, SUBSCRIPTION_DEPTH);
    }
}
