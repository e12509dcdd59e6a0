//! Thermal-emergency handling: alert subscriptions, ordered shutdown with
//! retries, and summary events.
use super::config::ThermalConfig;
use super::{Component, Operation, run_operation};
use crate::bus::BusConnection;
use crate::telemetry::{Metrics, unix_millis};
use shared::message::Message;
use shared::power::{
    ImmediateShutdownEvent, ThermalAction, ThermalEmergencyAlert, ThermalShutdownEvent,
    ThermalThrottleEvent,
};
use shared::subject;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_retry::Retry;
use tokio_retry::strategy::FixedInterval;
use tokio_util::sync::CancellationToken;

pub(super) fn spawn(
    ctx: CancellationToken,
    bus: BusConnection,
    components: Arc<HashMap<String, Arc<Component>>>,
    config: ThermalConfig,
    metrics: Metrics,
    state_prefix: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let monitor = Monitor {
            bus: bus.clone(),
            components,
            config,
            metrics,
            state_prefix,
        };
        let [mut sensors, mut thermal, mut explicit] =
            subject::THERMAL_ALERT_SUBJECTS.map(|s| bus.subscribe(s));
        loop {
            let message = tokio::select! {
                _ = ctx.cancelled() => return,
                Some(m) = sensors.recv() => m,
                Some(m) = thermal.recv() => m,
                Some(m) = explicit.recv() => m,
            };
            monitor.handle(&ctx, message).await;
        }
    })
}

struct Monitor {
    bus: BusConnection,
    components: Arc<HashMap<String, Arc<Component>>>,
    config: ThermalConfig,
    metrics: Metrics,
    state_prefix: String,
}

impl Monitor {
    async fn handle(&self, ctx: &CancellationToken, message: Message) {
        let alert: ThermalEmergencyAlert = match message.decode() {
            Ok(alert) => alert,
            Err(e) => {
                tracing::warn!(subject = %message.subject, error = %e, "bad thermal alert");
                return;
            }
        };
        tracing::warn!(
            temperature = alert.temperature,
            threshold = alert.threshold,
            action = ?alert.action,
            "thermal alert received"
        );

        match alert.action {
            ThermalAction::PowerThrottle => self.publish_event(
                subject::EVENT_THERMAL_THROTTLE,
                &ThermalThrottleEvent {
                    temperature: alert.temperature,
                    threshold: alert.threshold,
                    timestamp_ms: unix_millis(),
                },
            ),
            ThermalAction::ImmediateShutdown => {
                let shutdown = self.shutdown_components(ctx, true).await;
                self.publish_event(
                    subject::EVENT_IMMEDIATE_SHUTDOWN,
                    &ImmediateShutdownEvent {
                        components_shutdown: shutdown,
                        temperature: alert.temperature,
                        timestamp_ms: unix_millis(),
                    },
                );
            }
            ThermalAction::EmergencyShutdown => {
                if !self.config.enable_emergency_shutdown
                    || alert.temperature < self.config.shutdown_temperature_limit
                {
                    tracing::info!(
                        temperature = alert.temperature,
                        limit = self.config.shutdown_temperature_limit,
                        "emergency shutdown not triggered"
                    );
                    return;
                }
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = tokio::time::sleep(self.config.emergency_response_delay) => {}
                }
                let shutdown = self.shutdown_components(ctx, false).await;
                self.publish_event(
                    subject::EVENT_THERMAL_SHUTDOWN,
                    &ThermalShutdownEvent {
                        components_requested: self.config.shutdown_components.len() as u32,
                        components_shutdown: shutdown,
                        temperature: alert.temperature,
                        timestamp_ms: unix_millis(),
                    },
                );
            }
        }
    }

    /// Power the configured components off in order. Returns how many
    /// actually shut down.
    async fn shutdown_components(&self, ctx: &CancellationToken, force: bool) -> u32 {
        let operation = if force {
            Operation::ForceOff
        } else {
            Operation::PowerOff
        };
        let mut shutdown = 0;
        for name in &self.config.shutdown_components {
            let Some(component) = self.components.get(name) else {
                tracing::warn!(component = %name, "shutdown component not managed");
                continue;
            };
            let strategy = FixedInterval::new(self.config.emergency_attempt_interval)
                .take(self.config.max_emergency_attempts.saturating_sub(1) as usize);
            let attempt = || {
                run_operation(
                    component,
                    ctx,
                    operation,
                    &self.bus,
                    &self.metrics,
                    &self.state_prefix,
                )
            };
            match Retry::spawn(strategy, attempt).await {
                Ok(()) => shutdown += 1,
                Err(e) => {
                    tracing::error!(component = %name, error = %e, "emergency shutdown failed");
                }
            }
        }
        shutdown
    }

    fn publish_event<T: serde::Serialize>(&self, subject: &str, event: &T) {
        match shared::message::encode(event) {
            Ok(payload) => {
                self.bus.publish(Message::new(subject.to_string(), payload));
            }
            Err(e) => tracing::error!(error = %e, "event encoding failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::config::{
        BackendConfig, ComponentConfig, ComponentType, MockBackendConfig, PowerManagerConfig,
    };
    use super::super::PowerManager;
    use super::*;
    use crate::bus::Bus;
    use crate::service::Service;
    use shared::message::encode;
    use shared::power::AlertSeverity;
    use std::time::Duration;

    fn alert(action: ThermalAction, temperature: f64) -> ThermalEmergencyAlert {
        ThermalEmergencyAlert {
            alert_type: "thermal".into(),
            sensor_id: Some("cpu0".into()),
            sensor_name: Some("CPU0 Temp".into()),
            zone_name: None,
            temperature,
            threshold: 95.0,
            severity: AlertSeverity::Emergency,
            action,
            timestamp_ms: 1,
            message: "too hot".into(),
        }
    }

    async fn start_manager(bus: &Bus, thermal: ThermalConfig) -> CancellationToken {
        let components = vec![
            ComponentConfig::new(
                "host.0",
                ComponentType::Host,
                BackendConfig::Mock(MockBackendConfig {
                    initial_power: true,
                    ..MockBackendConfig::default()
                }),
            ),
            ComponentConfig::new(
                "host.1",
                ComponentType::Host,
                BackendConfig::Mock(MockBackendConfig {
                    initial_power: true,
                    ..MockBackendConfig::default()
                }),
            ),
        ];
        let manager = PowerManager::new(
            PowerManagerConfig {
                components,
                thermal,
                ..PowerManagerConfig::default()
            },
            bmc_gpio::Manager::default(),
            Metrics::new(),
        );
        let ctx = CancellationToken::new();
        tokio::spawn({
            let ctx = ctx.clone();
            let conn = bus.connection();
            async move { manager.run(ctx, conn).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx
    }

    #[tokio::test]
    async fn emergency_alert_shuts_down_components_in_order() {
        let bus = Bus::new();
        let ctx = start_manager(
            &bus,
            ThermalConfig {
                shutdown_components: vec!["host.0".into(), "host.1".into()],
                emergency_response_delay: Duration::from_millis(10),
                emergency_attempt_interval: Duration::from_millis(5),
                max_emergency_attempts: 2,
                ..ThermalConfig::default()
            },
        )
        .await;

        let mut events = bus.connection().subscribe(subject::EVENT_THERMAL_SHUTDOWN);
        let mut results = bus.connection().subscribe("statemgr.>");
        bus.connection().publish(Message::new(
            "sensormon.alerts.emergency",
            encode(&alert(ThermalAction::EmergencyShutdown, 96.0)).unwrap(),
        ));

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        let event: ThermalShutdownEvent = event.decode().unwrap();
        assert_eq!(event.components_shutdown, 2);
        assert_eq!(event.components_requested, 2);

        let first: shared::power::PowerOperationResult =
            results.recv().await.unwrap().decode().unwrap();
        let second: shared::power::PowerOperationResult =
            results.recv().await.unwrap().decode().unwrap();
        assert_eq!(first.component, "host.0");
        assert_eq!(second.component, "host.1");
        assert_eq!(first.operation, "power_off");

        ctx.cancel();
    }

    #[tokio::test]
    async fn below_limit_alert_is_ignored() {
        let bus = Bus::new();
        let ctx = start_manager(
            &bus,
            ThermalConfig {
                shutdown_components: vec!["host.0".into()],
                ..ThermalConfig::default()
            },
        )
        .await;

        let mut events = bus.connection().subscribe(subject::EVENT_THERMAL_SHUTDOWN);
        bus.connection().publish(Message::new(
            "thermalmgr.alerts.emergency",
            encode(&alert(ThermalAction::EmergencyShutdown, 80.0)).unwrap(),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.try_recv().is_none());
        ctx.cancel();
    }

    #[tokio::test]
    async fn throttle_alert_publishes_throttle_event() {
        let bus = Bus::new();
        let ctx = start_manager(&bus, ThermalConfig::default()).await;

        let mut events = bus.connection().subscribe(subject::EVENT_THERMAL_THROTTLE);
        bus.connection().publish(Message::new(
            "powermgr.emergency.thermal",
            encode(&alert(ThermalAction::PowerThrottle, 91.0)).unwrap(),
        ));
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        let event: ThermalThrottleEvent = event.decode().unwrap();
        assert_eq!(event.temperature, 91.0);
        ctx.cancel();
    }
}
