//! Long-running services, their supervisor, and bus request handlers.
use crate::bus::{BusConnection, Subscription};
use futures::FutureExt;
use futures::future::BoxFuture;
use shared::message::{Message, Reply, encode};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Service {service} panicked: {reason}")]
    Panicked { service: String, reason: String },

    #[error("Service {service} failed: {reason}")]
    Failed { service: String, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Component not found: {0}")]
    ComponentNotFound(String),

    #[error("Component disabled: {0}")]
    ComponentDisabled(String),

    #[error("Component busy: {0}")]
    ComponentBusy(String),

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Context canceled")]
    ContextCanceled,
}

/// Errors a request handler can turn into a wire reply.
pub trait ReplyError: std::fmt::Display {
    /// Stable kind tag carried in error replies.
    fn kind(&self) -> &'static str;

    fn to_reply(&self) -> shared::message::ErrorReply {
        shared::message::ErrorReply {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

impl ReplyError for ServiceError {
    fn kind(&self) -> &'static str {
        match self {
            ServiceError::Panicked { .. } => "ServicePanicked",
            ServiceError::Failed { .. } => "ServiceFailed",
            ServiceError::InvalidRequest(_) => "InvalidRequest",
            ServiceError::ComponentNotFound(_) => "ComponentNotFound",
            ServiceError::ComponentDisabled(_) => "ComponentDisabled",
            ServiceError::ComponentBusy(_) => "ComponentBusy",
            ServiceError::DeadlineExceeded => "DeadlineExceeded",
            ServiceError::ContextCanceled => "ContextCanceled",
        }
    }
}

/// A named long-running task driven by the supervisor.
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn run(
        &self,
        ctx: CancellationToken,
        bus: BusConnection,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;
}

/// How the supervisor reacts to a failing child.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

type ServiceFactory =
    Arc<dyn Fn(CancellationToken, BusConnection) -> BoxFuture<'static, Result<(), ServiceError>> + Send + Sync>;

struct ChildSpec {
    name: &'static str,
    factory: ServiceFactory,
}

/// Runs services, catches panics, restarts per policy, and unwinds in
/// reverse start order on shutdown.
pub struct Supervisor {
    bus: BusConnection,
    policy: RestartPolicy,
    children: Vec<ChildSpec>,
}

impl Supervisor {
    pub fn new(bus: BusConnection, policy: RestartPolicy) -> Self {
        Self {
            bus,
            policy,
            children: Vec::new(),
        }
    }

    pub fn add_service<S: Service>(&mut self, service: S) {
        let name = service.name();
        let service = Arc::new(service);
        self.children.push(ChildSpec {
            name,
            factory: Arc::new(move |ctx, bus| {
                let service = service.clone();
                async move { service.run(ctx, bus).await }.boxed()
            }),
        });
    }

    /// Run every child until `ctx` cancels, then stop them in reverse
    /// start order.
    pub async fn run(&self, ctx: CancellationToken) {
        let mut running = Vec::new();
        for child in &self.children {
            let token = ctx.child_token();
            let handle = tokio::spawn(Self::supervise(
                child.name,
                child.factory.clone(),
                token.clone(),
                self.bus.clone(),
                self.policy,
            ));
            running.push((child.name, token, handle));
            tracing::info!(service = child.name, "service started");
        }

        ctx.cancelled().await;
        for (name, token, handle) in running.into_iter().rev() {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(service = name, error = %e, "service task join failed");
            }
            tracing::info!(service = name, "service stopped");
        }
    }

    async fn supervise(
        name: &'static str,
        factory: ServiceFactory,
        ctx: CancellationToken,
        bus: BusConnection,
        policy: RestartPolicy,
    ) {
        let mut attempt = factory(ctx.clone(), bus.clone());
        let mut restarts = 0;
        loop {
            // The child runs in its own task so a panic is contained and
            // reported instead of tearing the supervisor down.
            let outcome = match tokio::spawn(attempt).await {
                Ok(result) => result,
                Err(join) if join.is_panic() => {
                    let reason = panic_reason(join.into_panic());
                    Err(ServiceError::Panicked {
                        service: name.to_string(),
                        reason,
                    })
                }
                Err(_) => Err(ServiceError::ContextCanceled),
            };

            match outcome {
                // A clean return means the service is one-shot and done.
                Ok(()) => return,
                Err(_) if ctx.is_cancelled() => return,
                Err(e) => {
                    tracing::error!(service = name, error = %e, "service failed");
                    if restarts >= policy.max_restarts {
                        tracing::error!(service = name, restarts, "restart budget exhausted");
                        return;
                    }
                    restarts += 1;
                    tokio::select! {
                        _ = ctx.cancelled() => return,
                        _ = tokio::time::sleep(policy.backoff) => {}
                    }
                    tracing::info!(service = name, attempt = restarts, "restarting service");
                    attempt = factory(ctx.clone(), bus.clone());
                }
            }
        }
    }
}

fn panic_reason(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Caches the `<service>.<kind>` prefix so repeated endpoints share it.
pub struct EndpointGroup {
    prefix: String,
}

impl EndpointGroup {
    pub fn new(service: &str, kind: &str) -> Self {
        Self {
            prefix: format!("{service}.{kind}"),
        }
    }

    pub fn endpoint(&self, id: u32, verb: &str) -> String {
        format!("{}.{id}.{verb}", self.prefix)
    }

    /// Subscription pattern covering every id in the group.
    pub fn wildcard(&self, verb: &str) -> String {
        format!("{}.*.{verb}", self.prefix)
    }
}

/// Serve a request endpoint: one task draining the subscription, one span
/// per request carrying the extracted trace context.
///
/// The parent token stops intake of new requests; a request already being
/// handled runs to completion so its reply is not lost. Handlers get the
/// parent token and may bail early themselves.
pub fn serve<F, Fut, E>(
    bus: BusConnection,
    ctx: CancellationToken,
    service: &'static str,
    pattern: String,
    handler: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(Message, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, E>> + Send,
    E: ReplyError + Send + 'static,
{
    let mut sub: Subscription = bus.subscribe(pattern.clone());
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = ctx.cancelled() => return,
                message = sub.recv() => match message {
                    Some(message) => message,
                    None => return,
                },
            };

            let span = tracing::info_span!(
                "bus_request",
                service,
                subject = %message.subject,
                trace_id = tracing::field::Empty,
                span_id = tracing::field::Empty,
            );
            if let Some(trace) = message.trace_context() {
                span.record("trace_id", trace.trace_id.as_str());
                span.record("span_id", trace.span_id.as_str());
            }

            let result = handler(message.clone(), ctx.clone())
                .instrument(span)
                .await;
            let reply = match result {
                Ok(payload) => Reply::Ok(payload),
                Err(e) => Reply::Err(e.to_reply()),
            };
            match encode(&reply) {
                Ok(payload) => bus.respond(&message, payload),
                Err(e) => tracing::error!(error = %e, "reply encoding failed"),
            }
        }
    })
}
