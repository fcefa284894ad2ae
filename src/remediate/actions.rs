//! Action catalogue, whitelist and parameter hygiene
//!
//! Every remediation primitive the system may execute is declared here with
//! its risk level, real-mode requirement and parameter format. Anything not
//! in the catalogue is never executed.

use crate::core::error::{SocError, SocResult};
use crate::core::types::Severity;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

const MAX_PARAMETER_LEN: usize = 1000;
const DANGEROUS_CHARS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '<', '>', '"', '\'', '\\', '\n', '\r',
];

/// Expected parameter shape per action kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamFormat {
    /// IPv4 or IPv6 address, parsed with the standard library.
    IpAddr,
    /// Opaque identifier: session, user, agent or generic target id.
    EntityId,
    /// Sanitized free text (notifications).
    FreeText,
}

/// Catalogue row for one action kind.
pub struct ActionSpec {
    pub kind: &'static str,
    pub risk_level: Severity,
    pub requires_real_mode: bool,
    pub param_format: ParamFormat,
}

pub const CATALOGUE: &[ActionSpec] = &[
    ActionSpec { kind: "block_ip", risk_level: Severity::High, requires_real_mode: true, param_format: ParamFormat::IpAddr },
    ActionSpec { kind: "rate_limit_ip", risk_level: Severity::Medium, requires_real_mode: false, param_format: ParamFormat::IpAddr },
    ActionSpec { kind: "rate_limit_user", risk_level: Severity::Medium, requires_real_mode: false, param_format: ParamFormat::EntityId },
    ActionSpec { kind: "terminate_session", risk_level: Severity::High, requires_real_mode: true, param_format: ParamFormat::EntityId },
    ActionSpec { kind: "suspend_user", risk_level: Severity::High, requires_real_mode: true, param_format: ParamFormat::EntityId },
    ActionSpec { kind: "isolate_agent", risk_level: Severity::Critical, requires_real_mode: true, param_format: ParamFormat::EntityId },
    ActionSpec { kind: "flag_user", risk_level: Severity::Medium, requires_real_mode: false, param_format: ParamFormat::EntityId },
    ActionSpec { kind: "initiate_forensics", risk_level: Severity::Medium, requires_real_mode: true, param_format: ParamFormat::EntityId },
    ActionSpec { kind: "enable_enhanced_monitoring", risk_level: Severity::Low, requires_real_mode: false, param_format: ParamFormat::EntityId },
    ActionSpec { kind: "notify_compliance_team", risk_level: Severity::Low, requires_real_mode: false, param_format: ParamFormat::FreeText },
    ActionSpec { kind: "require_human_review", risk_level: Severity::Low, requires_real_mode: false, param_format: ParamFormat::EntityId },
];

pub fn spec_for(kind: &str) -> Option<&'static ActionSpec> {
    CATALOGUE.iter().find(|s| s.kind == kind)
}

/// Strip shell metacharacters and bound length. Idempotent:
/// `sanitize(sanitize(x)) == sanitize(x)`.
pub fn sanitize_parameter(parameter: &str) -> String {
    let cleaned: String = parameter
        .chars()
        .filter(|c| !DANGEROUS_CHARS.contains(c))
        .collect();
    let trimmed = cleaned.trim();
    trimmed.chars().take(MAX_PARAMETER_LEN).collect()
}

fn validate_parameter(spec: &ActionSpec, parameter: &str) -> SocResult<()> {
    if parameter.is_empty() {
        return Err(SocError::Validation(format!(
            "empty parameter for action '{}'",
            spec.kind
        )));
    }
    match spec.param_format {
        ParamFormat::IpAddr => {
            parameter.parse::<IpAddr>().map_err(|_| {
                SocError::Validation(format!("'{}' is not a valid IP address", parameter))
            })?;
        }
        ParamFormat::EntityId => {
            if !parameter
                .chars()
                .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '@'))
            {
                return Err(SocError::Validation(format!(
                    "invalid characters in id parameter '{}'",
                    parameter
                )));
            }
        }
        ParamFormat::FreeText => {} // sanitization already applied
    }
    Ok(())
}

/// A single whitelisted, validated remediation step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Action {
    pub kind: String,
    pub parameter: String,
    pub risk_level: Severity,
    pub requires_real_mode: bool,
}

impl Action {
    /// Build a validated action: whitelist lookup, sanitization, per-kind
    /// format check.
    pub fn new(kind: &str, parameter: &str) -> SocResult<Action> {
        let spec = spec_for(kind).ok_or_else(|| {
            SocError::Validation(format!("action kind '{}' is not whitelisted", kind))
        })?;
        let parameter = sanitize_parameter(parameter);
        validate_parameter(spec, &parameter)?;
        Ok(Action {
            kind: spec.kind.to_string(),
            parameter,
            risk_level: spec.risk_level,
            requires_real_mode: spec.requires_real_mode,
        })
    }

    /// Re-validate an action that arrived over the wire (its recorded risk
    /// metadata is not trusted).
    pub fn revalidate(&self) -> SocResult<Action> {
        Action::new(&self.kind, &self.parameter)
    }

    pub fn is_high_risk(&self) -> bool {
        self.risk_level >= Severity::High || self.requires_real_mode
    }
}

/// Parse the backward-compatible single-string target form:
/// `"block_ip:1.2.3.4,terminate_session:sess-9"`.
pub fn parse_legacy_target(target: &str) -> Vec<(String, String)> {
    target
        .split(',')
        .filter_map(|piece| {
            let piece = piece.trim();
            if piece.is_empty() {
                return None;
            }
            match piece.split_once(':') {
                Some((kind, param)) => Some((kind.trim().to_string(), param.trim().to_string())),
                None => Some((piece.to_string(), String::new())),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_rejects_unknown_kind() {
        assert!(Action::new("format_disk", "sda1").is_err());
    }

    #[test]
    fn block_ip_requires_valid_address() {
        assert!(Action::new("block_ip", "203.0.113.10").is_ok());
        assert!(Action::new("block_ip", "2001:db8::1").is_ok());
        assert!(Action::new("block_ip", "not-an-ip").is_err());
        assert!(Action::new("block_ip", "999.1.1.1").is_err());
    }

    #[test]
    fn sanitize_is_idempotent() {
        let raw = "sess-1; rm -rf / && echo `pwd` $(id) > '\"x\"'";
        let once = sanitize_parameter(raw);
        assert_eq!(sanitize_parameter(&once), once);
        assert!(!once.contains(';'));
        assert!(!once.contains('`'));
        assert!(!once.contains('$'));
    }

    #[test]
    fn sanitize_bounds_length() {
        let long = "a".repeat(5000);
        assert_eq!(sanitize_parameter(&long).len(), 1000);
    }

    #[test]
    fn metadata_comes_from_catalogue_not_caller() {
        let action = Action::new("isolate_agent", "agent-7").unwrap();
        assert_eq!(action.risk_level, Severity::Critical);
        assert!(action.requires_real_mode);
    }

    #[test]
    fn legacy_target_parses_pairs() {
        let parsed = parse_legacy_target("block_ip:203.0.113.10, terminate_session:sess-9");
        assert_eq!(
            parsed,
            vec![
                ("block_ip".to_string(), "203.0.113.10".to_string()),
                ("terminate_session".to_string(), "sess-9".to_string()),
            ]
        );
    }
}
