//! Access policy evaluation.
//!
//! `validate` is pure: it reads a policy document, the session context, the
//! caller's current stream count and the device description, and either
//! admits the request or names the first violated rule. Rules are checked in
//! a fixed order: expiry, rental window, region, device, concurrency.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// HDCP (High-bandwidth Digital Content Protection) requirements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HdcpRequirement {
    #[default]
    NotRequired,
    /// HDCP 1.x or 2.0
    Type0,
    /// HDCP 2.2+
    Type1,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceRequirements {
    pub hdcp: HdcpRequirement,
    /// 0=none, 1=baseline, 2=main
    pub min_security_level: u8,
    pub allow_virtual_machine: bool,
}

impl DeviceRequirements {
    pub fn permissive() -> Self {
        DeviceRequirements {
            hdcp: HdcpRequirement::NotRequired,
            min_security_level: 0,
            allow_virtual_machine: true,
        }
    }
}

/// Attributes the subscriber's device reports about itself.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceInfo {
    pub supports_hdcp_type_0: bool,
    pub supports_hdcp_type_1: bool,
    pub security_level: u8,
    pub is_virtual_machine: bool,
}

/// The policy bound into a collection header.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument {
    /// `None` means no limit at this layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_streams: Option<u32>,
    /// `None` or empty means every region is allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_regions: Option<Vec<String>>,
    #[serde(default)]
    pub device_requirements: DeviceRequirements,
    /// Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<i64>,
    /// Playback window measured from the user's first play of the asset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playback_window_seconds: Option<i64>,
}

impl PolicyDocument {
    pub fn from_json(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Who is asking and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub user_id: String,
    pub asset_id: String,
    pub geo_region: Option<String>,
    /// Unix seconds.
    pub now: i64,
    pub first_play: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum PolicyViolation {
    #[error("Policy expired at {expiry}")]
    Expired { expiry: i64 },
    #[error("Playback window ended at {ended_at}")]
    RentalWindowExpired { ended_at: i64 },
    #[error("Region {region:?} is not allowed")]
    GeoRestricted { region: Option<String> },
    #[error("HDCP {required:?} not supported by device")]
    HdcpNotSupported { required: HdcpRequirement },
    #[error("Device security level {actual} below required {required}")]
    SecurityLevelInsufficient { required: u8, actual: u8 },
    #[error("Virtual machines are not allowed")]
    VirtualMachineNotAllowed,
    #[error("Concurrency limit exceeded: {current}/{max} streams")]
    ConcurrencyLimitExceeded { current: u32, max: u32 },
}

pub fn validate(
    policy: &PolicyDocument,
    context: &SessionContext,
    current_active_streams: u32,
    device: &DeviceInfo,
) -> Result<(), PolicyViolation> {
    validate_expiry(policy, context)?;
    validate_geo_access(policy, context)?;
    validate_device(&policy.device_requirements, device)?;
    validate_concurrency(policy, current_active_streams)
}

fn validate_expiry(policy: &PolicyDocument, context: &SessionContext) -> Result<(), PolicyViolation> {
    if let Some(expiry) = policy.expiry {
        if context.now >= expiry {
            return Err(PolicyViolation::Expired { expiry });
        }
    }
    if let (Some(window), Some(first_play)) = (policy.playback_window_seconds, context.first_play) {
        let ended_at = first_play.saturating_add(window);
        if context.now >= ended_at {
            return Err(PolicyViolation::RentalWindowExpired { ended_at });
        }
    }
    Ok(())
}

fn validate_geo_access(policy: &PolicyDocument, context: &SessionContext) -> Result<(), PolicyViolation> {
    let allowed = match policy.allowed_regions.as_deref() {
        Some(list) if !list.is_empty() => list,
        _ => return Ok(()),
    };
    match context.geo_region.as_deref() {
        Some(region) if allowed.iter().any(|r| r.eq_ignore_ascii_case(region)) => Ok(()),
        other => Err(PolicyViolation::GeoRestricted {
            region: other.map(str::to_string),
        }),
    }
}

fn validate_device(requirements: &DeviceRequirements, device: &DeviceInfo) -> Result<(), PolicyViolation> {
    let hdcp_ok = match requirements.hdcp {
        HdcpRequirement::NotRequired => true,
        // Type 1 devices also satisfy Type 0
        HdcpRequirement::Type0 => device.supports_hdcp_type_0 || device.supports_hdcp_type_1,
        HdcpRequirement::Type1 => device.supports_hdcp_type_1,
    };
    if !hdcp_ok {
        return Err(PolicyViolation::HdcpNotSupported {
            required: requirements.hdcp,
        });
    }
    if device.security_level < requirements.min_security_level {
        return Err(PolicyViolation::SecurityLevelInsufficient {
            required: requirements.min_security_level,
            actual: device.security_level,
        });
    }
    if device.is_virtual_machine && !requirements.allow_virtual_machine {
        return Err(PolicyViolation::VirtualMachineNotAllowed);
    }
    Ok(())
}

fn validate_concurrency(policy: &PolicyDocument, current_active_streams: u32) -> Result<(), PolicyViolation> {
    match policy.max_concurrent_streams {
        Some(max) if current_active_streams >= max => Err(PolicyViolation::ConcurrencyLimitExceeded {
            current: current_active_streams,
            max,
        }),
        _ => Ok(()),
    }
}
