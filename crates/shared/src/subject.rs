//! Bus subject conventions.
//!
//! Subjects are dot-separated tokens. The conventional service pattern is
//! `<service>.<kind>.<id>.<verb>`, e.g. `powermgr.host.0.action`. Subscription
//! patterns may use `*` to match exactly one token and `>` to match the rest
//! of the subject.

/// Ingress verb handled by the power manager.
pub const VERB_ACTION: &str = "action";
/// Read-only verb answering the cached power state.
pub const VERB_STATUS: &str = "status";

pub const POWERMGR: &str = "powermgr";

/// Subjects the power manager subscribes to for thermal emergencies.
pub const THERMAL_ALERT_SUBJECTS: [&str; 3] = [
    "sensormon.alerts.emergency",
    "thermalmgr.alerts.emergency",
    "powermgr.emergency.thermal",
];

pub const EVENT_THERMAL_SHUTDOWN: &str = "powermgr.events.thermal_shutdown";
pub const EVENT_IMMEDIATE_SHUTDOWN: &str = "powermgr.events.immediate_shutdown";
pub const EVENT_THERMAL_THROTTLE: &str = "powermgr.events.thermal_throttle";

/// Build a service endpoint subject, `<service>.<kind>.<id>.<verb>`.
pub fn endpoint(service: &str, kind: &str, id: u32, verb: &str) -> String {
    format!("{service}.{kind}.{id}.{verb}")
}

/// Build the power-result subject the state manager consumes,
/// `<state_prefix>.<component>.power.result`.
pub fn power_result(state_prefix: &str, component: &str) -> String {
    format!("{state_prefix}.{component}.power.result")
}

/// Match a concrete subject against a subscription pattern.
///
/// `*` matches exactly one token, `>` matches one or more trailing tokens.
/// Neither wildcard matches an empty subject.
pub fn matches(pattern: &str, subject: &str) -> bool {
    if subject.is_empty() {
        return pattern.is_empty();
    }
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');

    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_subjects_match_themselves() {
        assert!(matches("powermgr.host.0.action", "powermgr.host.0.action"));
        assert!(!matches("powermgr.host.0.action", "powermgr.host.1.action"));
        assert!(!matches("powermgr.host.0", "powermgr.host.0.action"));
        assert!(!matches("powermgr.host.0.action", "powermgr.host.0"));
    }

    #[test]
    fn star_matches_one_token() {
        assert!(matches("powermgr.*.0.action", "powermgr.host.0.action"));
        assert!(matches("powermgr.*.0.action", "powermgr.chassis.0.action"));
        assert!(!matches("powermgr.*.action", "powermgr.host.0.action"));
        assert!(!matches("*", ""));
    }

    #[test]
    fn gt_matches_rest() {
        assert!(matches("powermgr.>", "powermgr.host.0.action"));
        assert!(matches(">", "anything.at.all"));
        assert!(!matches("powermgr.>", "powermgr"));
        assert!(!matches(">", ""));
    }

    #[test]
    fn endpoint_format() {
        assert_eq!(endpoint("powermgr", "host", 0, VERB_ACTION), "powermgr.host.0.action");
        assert_eq!(power_result("statemgr", "host.0"), "statemgr.host.0.power.result");
    }
}
