//! Power-management wire types.
use crate::message::{CodecError, encode};

/// Remote action on a host component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostAction {
    On,
    Off,
    ForceOff,
    Reboot,
    ForceRestart,
}

/// Remote action on a chassis component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChassisAction {
    On,
    Off,
    EmergencyShutdown,
    PowerCycle,
}

/// Remote action on the BMC itself. All variants map to a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BmcAction {
    Reboot,
    WarmReset,
    ColdReset,
    HardReset,
    FactoryReset,
}

#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize)]
pub struct ChangeHostStateRequest {
    pub action: HostAction,
}

#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize)]
pub struct ChangeChassisStateRequest {
    pub action: ChassisAction,
}

#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize)]
pub struct ChangeBmcStateRequest {
    pub action: BmcAction,
}

/// Coarse power state reported back to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CurrentStatus {
    On,
    Off,
    Transitioning,
    Unknown,
}

/// Reply to a state-change request.
#[derive(Debug, Clone, Copy, serde::Deserialize, serde::Serialize)]
pub struct ChangeStateResponse {
    pub current_status: CurrentStatus,
}

/// Reply to a `status` query.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct PowerStatusReply {
    pub component: String,
    pub powered: bool,
}

/// Outcome of one backend power operation, published for the state manager.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct PowerOperationResult {
    pub component: String,
    pub operation: String,
    pub success: bool,
    /// Unix timestamp, milliseconds.
    pub completed_at_ms: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl PowerOperationResult {
    pub fn to_payload(&self) -> Result<Vec<u8>, CodecError> {
        encode(self)
    }
}

/// Severity of a thermal alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
    Emergency,
}

/// Action an alert asks the power manager to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermalAction {
    EmergencyShutdown,
    ImmediateShutdown,
    PowerThrottle,
}

/// Thermal-emergency alert consumed from the monitoring services.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ThermalEmergencyAlert {
    pub alert_type: String,
    pub sensor_id: Option<String>,
    pub sensor_name: Option<String>,
    pub zone_name: Option<String>,
    pub temperature: f64,
    pub threshold: f64,
    pub severity: AlertSeverity,
    pub action: ThermalAction,
    /// Unix timestamp, milliseconds.
    pub timestamp_ms: u64,
    pub message: String,
}

/// Summary event published after an emergency shutdown pass.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ThermalShutdownEvent {
    pub components_requested: u32,
    pub components_shutdown: u32,
    pub temperature: f64,
    pub timestamp_ms: u64,
}

/// Event published when a forced immediate shutdown was executed.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ImmediateShutdownEvent {
    pub components_shutdown: u32,
    pub temperature: f64,
    pub timestamp_ms: u64,
}

/// Throttle request event. Actual throttling is a platform hook.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ThermalThrottleEvent {
    pub temperature: f64,
    pub threshold: f64,
    pub timestamp_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::encode;

    #[test]
    fn action_round_trip() {
        let req = ChangeHostStateRequest {
            action: HostAction::ForceOff,
        };
        let bytes = encode(&req).unwrap();
        let back: ChangeHostStateRequest = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back.action, HostAction::ForceOff);
    }

    #[test]
    fn result_payload_carries_error() {
        let result = PowerOperationResult {
            component: "host.0".into(),
            operation: "power_on".into(),
            success: false,
            completed_at_ms: 1,
            duration_ms: 2,
            error: Some("line closed".into()),
        };
        let bytes = result.to_payload().unwrap();
        let back: PowerOperationResult = postcard::from_bytes(&bytes).unwrap();
        assert!(!back.success);
        assert_eq!(back.error.as_deref(), Some("line closed"));
    }
}
