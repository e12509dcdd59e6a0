//! The power-management service: bus actions in, backend calls out,
//! results published for the state manager.
pub mod backend;
pub mod config;
mod thermal;

use crate::bus::BusConnection;
use crate::service::{EndpointGroup, ReplyError, Service, ServiceError, serve};
use crate::telemetry::{Metrics, unix_millis};
use backend::{Backend, BackendError};
use config::{ComponentConfig, ComponentType, PowerManagerConfig};
use shared::message::{Message, encode};
use shared::power::{
    BmcAction, ChangeBmcStateRequest, ChangeChassisStateRequest, ChangeHostStateRequest,
    ChangeStateResponse, ChassisAction, CurrentStatus, HostAction, PowerOperationResult,
    PowerStatusReply,
};
use shared::subject;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Gap between the off and on legs of a chassis power cycle.
const POWER_CYCLE_GAP: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum PowerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Component not found: {0}")]
    ComponentNotFound(String),

    #[error("Component disabled: {0}")]
    ComponentDisabled(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Power operation failed: {0}")]
    OperationFailed(#[from] BackendError),
}

impl ReplyError for PowerError {
    fn kind(&self) -> &'static str {
        match self {
            PowerError::InvalidRequest(_) => "InvalidRequest",
            PowerError::ComponentNotFound(_) => "ComponentNotFound",
            PowerError::ComponentDisabled(_) => "ComponentDisabled",
            PowerError::Timeout => "OperationTimeout",
            PowerError::OperationFailed(_) => "PowerOperationFailed",
        }
    }
}

/// One backend operation as mapped from a remote action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    PowerOn,
    PowerOff,
    ForceOff,
    Reset,
    PowerCycle,
}

impl Operation {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Operation::PowerOn => "power_on",
            Operation::PowerOff => "power_off",
            Operation::ForceOff => "force_off",
            Operation::Reset => "reset",
            Operation::PowerCycle => "power_cycle",
        }
    }
}

pub(crate) struct Component {
    pub(crate) config: ComponentConfig,
    /// `None` for disabled components. The mutex serializes operations on
    /// one component; different components run in parallel.
    backend: Option<tokio::sync::Mutex<Backend>>,
}

impl Component {
    async fn execute(&self, ctx: &CancellationToken, operation: Operation) -> Result<(), PowerError> {
        let backend = self
            .backend
            .as_ref()
            .ok_or_else(|| PowerError::ComponentDisabled(self.config.name.clone()))?;
        let backend = backend.lock().await;

        let work = async {
            match operation {
                Operation::PowerOn => backend.power_on(ctx).await,
                Operation::PowerOff => backend.power_off(ctx, false).await,
                Operation::ForceOff => backend.power_off(ctx, true).await,
                Operation::Reset => backend.reset(ctx).await,
                Operation::PowerCycle => {
                    backend.power_off(ctx, false).await?;
                    tokio::select! {
                        _ = ctx.cancelled() => {
                            return Err(BackendError::OperationFailed("canceled".into()));
                        }
                        _ = tokio::time::sleep(POWER_CYCLE_GAP) => {}
                    }
                    backend.power_on(ctx).await
                }
            }
        };
        match tokio::time::timeout(self.config.operation_timeout, work).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(PowerError::Timeout),
        }
    }

    async fn power_status(&self) -> Result<bool, PowerError> {
        let backend = self
            .backend
            .as_ref()
            .ok_or_else(|| PowerError::ComponentDisabled(self.config.name.clone()))?;
        Ok(backend.lock().await.get_power_status().await?)
    }
}

/// Execute one operation and publish its result; metrics included.
pub(crate) async fn run_operation(
    component: &Component,
    ctx: &CancellationToken,
    operation: Operation,
    bus: &BusConnection,
    metrics: &Metrics,
    state_prefix: &str,
) -> Result<(), PowerError> {
    let name = component.config.name.as_str();
    let started = std::time::Instant::now();
    let result = component.execute(ctx, operation).await;
    let duration = started.elapsed();

    metrics
        .operations_total
        .with_label_values(&[name, operation.name()])
        .inc();
    metrics
        .operation_duration_seconds
        .with_label_values(&[name, operation.name()])
        .observe(duration.as_secs_f64());
    if operation == Operation::PowerCycle {
        metrics.power_cycles_total.with_label_values(&[name]).inc();
    }
    if result.is_err() {
        metrics
            .failures_total
            .with_label_values(&[name, operation.name()])
            .inc();
    }

    let published = PowerOperationResult {
        component: name.to_string(),
        operation: operation.name().to_string(),
        success: result.is_ok(),
        completed_at_ms: unix_millis(),
        duration_ms: duration.as_millis() as u64,
        error: result.as_ref().err().map(|e| e.to_string()),
    };
    match published.to_payload() {
        Ok(payload) => {
            bus.publish(Message::new(
                subject::power_result(state_prefix, name),
                payload,
            ));
        }
        Err(e) => tracing::error!(error = %e, "power result encoding failed"),
    }

    match &result {
        Ok(()) => tracing::info!(component = name, operation = operation.name(), "power operation done"),
        Err(e) => tracing::warn!(component = name, operation = operation.name(), error = %e, "power operation failed"),
    }
    result
}

fn map_host(action: HostAction) -> Operation {
    match action {
        HostAction::On => Operation::PowerOn,
        HostAction::Off => Operation::PowerOff,
        HostAction::ForceOff => Operation::ForceOff,
        HostAction::Reboot | HostAction::ForceRestart => Operation::Reset,
    }
}

fn map_chassis(action: ChassisAction) -> Operation {
    match action {
        ChassisAction::On => Operation::PowerOn,
        ChassisAction::Off => Operation::PowerOff,
        ChassisAction::EmergencyShutdown => Operation::ForceOff,
        ChassisAction::PowerCycle => Operation::PowerCycle,
    }
}

fn map_bmc(action: BmcAction) -> Operation {
    match action {
        BmcAction::Reboot
        | BmcAction::WarmReset
        | BmcAction::ColdReset
        | BmcAction::HardReset
        | BmcAction::FactoryReset => Operation::Reset,
    }
}

/// The service. Backends are built at `run` time so a supervisor restart
/// re-initializes the hardware handles.
pub struct PowerManager {
    config: PowerManagerConfig,
    gpio: bmc_gpio::Manager,
    metrics: Metrics,
}

impl PowerManager {
    pub fn new(config: PowerManagerConfig, gpio: bmc_gpio::Manager, metrics: Metrics) -> Self {
        Self {
            config,
            gpio,
            metrics,
        }
    }

    fn build_components(&self) -> Result<HashMap<String, Arc<Component>>, ServiceError> {
        let mut components = HashMap::new();
        for config in &self.config.components {
            let backend = if config.enabled {
                let backend = Backend::init(&self.gpio, config).map_err(|e| {
                    ServiceError::Failed {
                        service: "powermgr".into(),
                        reason: format!("{} backend: {e}", config.name),
                    }
                })?;
                Some(tokio::sync::Mutex::new(backend))
            } else {
                None
            };
            components.insert(
                config.name.clone(),
                Arc::new(Component {
                    config: config.clone(),
                    backend,
                }),
            );
        }
        Ok(components)
    }

    fn serve_kind(
        &self,
        ctx: &CancellationToken,
        bus: &BusConnection,
        components: &Arc<HashMap<String, Arc<Component>>>,
        kind: ComponentType,
    ) {
        let group = EndpointGroup::new("powermgr", kind.as_str());

        let action_ctx = HandlerCtx {
            bus: bus.clone(),
            components: components.clone(),
            metrics: self.metrics.clone(),
            state_prefix: self.config.state_prefix.clone(),
        };
        serve(
            bus.clone(),
            ctx.clone(),
            "powermgr",
            group.wildcard(subject::VERB_ACTION),
            move |message, ctx| {
                let handler = action_ctx.clone();
                async move { handler.handle_action(kind, message, ctx).await }
            },
        );

        let status_components = components.clone();
        serve(
            bus.clone(),
            ctx.clone(),
            "powermgr",
            group.wildcard(subject::VERB_STATUS),
            move |message, _ctx| {
                let components = status_components.clone();
                async move {
                    let component = lookup(&components, &message.subject)?;
                    let powered = component.power_status().await?;
                    encode(&PowerStatusReply {
                        component: component.config.name.clone(),
                        powered,
                    })
                    .map_err(|e| PowerError::InvalidRequest(e.to_string()))
                }
            },
        );
    }
}

#[derive(Clone)]
struct HandlerCtx {
    bus: BusConnection,
    components: Arc<HashMap<String, Arc<Component>>>,
    metrics: Metrics,
    state_prefix: String,
}

impl HandlerCtx {
    async fn handle_action(
        &self,
        kind: ComponentType,
        message: Message,
        ctx: CancellationToken,
    ) -> Result<Vec<u8>, PowerError> {
        let component = lookup(&self.components, &message.subject)?;
        if component.config.component_type != kind {
            return Err(PowerError::InvalidRequest(format!(
                "component {} is not a {}",
                component.config.name,
                kind.as_str()
            )));
        }

        let operation = match kind {
            ComponentType::Host => {
                let request: ChangeHostStateRequest = decode(&message)?;
                map_host(request.action)
            }
            ComponentType::Chassis => {
                let request: ChangeChassisStateRequest = decode(&message)?;
                map_chassis(request.action)
            }
            ComponentType::Bmc => {
                let request: ChangeBmcStateRequest = decode(&message)?;
                map_bmc(request.action)
            }
        };

        run_operation(
            &component,
            &ctx,
            operation,
            &self.bus,
            &self.metrics,
            &self.state_prefix,
        )
        .await?;

        encode(&ChangeStateResponse {
            current_status: CurrentStatus::Transitioning,
        })
        .map_err(|e| PowerError::InvalidRequest(e.to_string()))
    }
}

fn decode<'a, T: serde::Deserialize<'a>>(message: &'a Message) -> Result<T, PowerError> {
    message
        .decode()
        .map_err(|e| PowerError::InvalidRequest(e.to_string()))
}

/// Resolve `powermgr.<kind>.<id>.<verb>` to a component.
fn lookup(
    components: &HashMap<String, Arc<Component>>,
    subject: &str,
) -> Result<Arc<Component>, PowerError> {
    let mut tokens = subject.split('.');
    let (Some(_service), Some(kind), Some(id), Some(_verb), None) = (
        tokens.next(),
        tokens.next(),
        tokens.next(),
        tokens.next(),
        tokens.next(),
    ) else {
        return Err(PowerError::InvalidRequest(format!("bad subject {subject}")));
    };
    if id.parse::<u32>().is_err() {
        return Err(PowerError::InvalidRequest(format!("bad subject {subject}")));
    }
    let name = format!("{kind}.{id}");
    components
        .get(&name)
        .cloned()
        .ok_or(PowerError::ComponentNotFound(name))
}

impl Service for PowerManager {
    fn name(&self) -> &'static str {
        "powermgr"
    }

    async fn run(&self, ctx: CancellationToken, bus: BusConnection) -> Result<(), ServiceError> {
        let components = Arc::new(self.build_components()?);
        tracing::info!(components = components.len(), "power manager ready");

        for kind in [ComponentType::Host, ComponentType::Chassis, ComponentType::Bmc] {
            self.serve_kind(&ctx, &bus, &components, kind);
        }

        let thermal = thermal::spawn(
            ctx.clone(),
            bus.clone(),
            components.clone(),
            self.config.thermal.clone(),
            self.metrics.clone(),
            self.config.state_prefix.clone(),
        );

        ctx.cancelled().await;
        let _ = thermal.await;

        for component in components.values() {
            if let Some(backend) = &component.backend {
                backend.lock().await.close();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::config::{BackendConfig, MockBackendConfig};
    use super::*;
    use crate::bus::Bus;
    use shared::message::Reply;

    fn mock_component(name: &str, kind: ComponentType) -> ComponentConfig {
        ComponentConfig::new(name, kind, BackendConfig::Mock(MockBackendConfig::default()))
    }

    fn manager_with(components: Vec<ComponentConfig>) -> PowerManager {
        PowerManager::new(
            PowerManagerConfig {
                components,
                ..PowerManagerConfig::default()
            },
            bmc_gpio::Manager::default(),
            Metrics::new(),
        )
    }

    async fn request_action<R: serde::Serialize>(
        bus: &Bus,
        subject: &str,
        request: &R,
    ) -> Reply<Vec<u8>> {
        let reply = bus
            .connection()
            .request(subject, encode(request).unwrap(), Duration::from_secs(5))
            .await
            .unwrap();
        reply.decode().unwrap()
    }

    #[tokio::test]
    async fn host_power_on_publishes_result_and_replies_transitioning() {
        let bus = Bus::new();
        let manager = manager_with(vec![mock_component("host.0", ComponentType::Host)]);
        let ctx = CancellationToken::new();
        let mut results = bus.connection().subscribe("statemgr.host.0.power.result");
        let run = tokio::spawn({
            let ctx = ctx.clone();
            let conn = bus.connection();
            async move { manager.run(ctx, conn).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let reply = request_action(
            &bus,
            "powermgr.host.0.action",
            &ChangeHostStateRequest {
                action: HostAction::On,
            },
        )
        .await;
        let payload = reply.into_result().unwrap();
        let response: ChangeStateResponse = postcard::from_bytes(&payload).unwrap();
        assert_eq!(response.current_status, CurrentStatus::Transitioning);

        let result = results.recv().await.unwrap();
        let result: PowerOperationResult = result.decode().unwrap();
        assert_eq!(result.component, "host.0");
        assert_eq!(result.operation, "power_on");
        assert!(result.success);

        ctx.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn chassis_power_cycle_runs_off_gap_on() {
        let bus = Bus::new();
        let manager = manager_with(vec![mock_component("chassis.0", ComponentType::Chassis)]);
        let ctx = CancellationToken::new();
        let mut results = bus.connection().subscribe("statemgr.chassis.0.power.result");
        let run = tokio::spawn({
            let ctx = ctx.clone();
            let conn = bus.connection();
            async move { manager.run(ctx, conn).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let reply = request_action(
            &bus,
            "powermgr.chassis.0.action",
            &ChangeChassisStateRequest {
                action: ChassisAction::PowerCycle,
            },
        )
        .await;
        assert!(reply.into_result().is_ok());

        let result: PowerOperationResult = results.recv().await.unwrap().decode().unwrap();
        assert_eq!(result.operation, "power_cycle");
        assert!(result.success);

        ctx.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_component_reports_not_found() {
        let bus = Bus::new();
        let manager = manager_with(vec![mock_component("host.0", ComponentType::Host)]);
        let ctx = CancellationToken::new();
        let run = tokio::spawn({
            let ctx = ctx.clone();
            let conn = bus.connection();
            async move { manager.run(ctx, conn).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let reply = request_action(
            &bus,
            "powermgr.host.7.action",
            &ChangeHostStateRequest {
                action: HostAction::On,
            },
        )
        .await;
        let err = reply.into_result().unwrap_err();
        assert_eq!(err.kind, "ComponentNotFound");

        ctx.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn disabled_component_rejects_actions() {
        let bus = Bus::new();
        let mut component = mock_component("chassis.0", ComponentType::Chassis);
        component.enabled = false;
        let manager = manager_with(vec![component]);
        let ctx = CancellationToken::new();
        let run = tokio::spawn({
            let ctx = ctx.clone();
            let conn = bus.connection();
            async move { manager.run(ctx, conn).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let reply = request_action(
            &bus,
            "powermgr.chassis.0.action",
            &ChangeChassisStateRequest {
                action: ChassisAction::On,
            },
        )
        .await;
        assert_eq!(reply.into_result().unwrap_err().kind, "ComponentDisabled");

        ctx.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn status_endpoint_reads_backend() {
        let bus = Bus::new();
        let mut config = MockBackendConfig::default();
        config.initial_power = true;
        let manager = manager_with(vec![ComponentConfig::new(
            "host.0",
            ComponentType::Host,
            BackendConfig::Mock(config),
        )]);
        let ctx = CancellationToken::new();
        let run = tokio::spawn({
            let ctx = ctx.clone();
            let conn = bus.connection();
            async move { manager.run(ctx, conn).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let reply = bus
            .connection()
            .request("powermgr.host.0.status", Vec::new(), Duration::from_secs(5))
            .await
            .unwrap();
        let reply: Reply<Vec<u8>> = reply.decode().unwrap();
        let status: PowerStatusReply =
            postcard::from_bytes(&reply.into_result().unwrap()).unwrap();
        assert!(status.powered);

        ctx.cancel();
        run.await.unwrap().unwrap();
    }

    #[test]
    fn action_mapping_matches_contract() {
        assert_eq!(map_host(HostAction::ForceOff), Operation::ForceOff);
        assert_eq!(map_host(HostAction::Reboot), Operation::Reset);
        assert_eq!(map_host(HostAction::ForceRestart), Operation::Reset);
        assert_eq!(map_chassis(ChassisAction::PowerCycle), Operation::PowerCycle);
        assert_eq!(
            map_chassis(ChassisAction::EmergencyShutdown),
            Operation::ForceOff
        );
        assert_eq!(map_bmc(BmcAction::FactoryReset), Operation::Reset);
    }
}
