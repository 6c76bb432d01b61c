//! Core types shared by the session state machine and the persistence layer.

use serde::{Deserialize, Serialize};

/// Membership tier as carried on the member's badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipTier {
    Basic,
    Premium,
    Elite,
    Vip,
}

impl MembershipTier {
    /// Session-timeout multiplier for this tier.
    pub fn timeout_multiplier(&self) -> f64 {
        match self {
            MembershipTier::Basic => 1.0,
            MembershipTier::Premium | MembershipTier::Elite => 2.0,
            MembershipTier::Vip => 2.5,
        }
    }
}

/// Inbound "member scanned" event from the badge reader collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadgeScan {
    pub member_id: String,
    pub first_name: String,
    pub membership_type: MembershipTier,
    #[serde(default)]
    pub total_visits: i64,
}

/// Member identity captured for the lifetime of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub member_id: String,
    pub first_name: String,
    pub membership_tier: MembershipTier,
    pub total_visits: i64,
}

impl From<BadgeScan> for Member {
    fn from(scan: BadgeScan) -> Self {
        Member {
            member_id: scan.member_id,
            first_name: scan.first_name,
            membership_tier: scan.membership_type,
            total_visits: scan.total_visits,
        }
    }
}

/// The session state machine's states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Loading,
    Authenticated,
    VoiceActive,
    Ending,
    Error,
}

impl SessionStatus {
    /// An active status holds a member and may schedule timers.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionStatus::Loading | SessionStatus::Authenticated | SessionStatus::VoiceActive | SessionStatus::Error
        )
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    Natural,
    Timeout,
    Error,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Natural => "natural",
            EndReason::Timeout => "timeout",
            EndReason::Error => "error",
        }
    }
}

impl std::str::FromStr for EndReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "natural" => Ok(EndReason::Natural),
            "timeout" => Ok(EndReason::Timeout),
            "error" => Ok(EndReason::Error),
            other => Err(format!("unknown end reason: {other}")),
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection status reported by the external voice channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceStatus {
    Connecting,
    Connected,
    Listening,
    Speaking,
    Error,
}

/// Usage totals reported by the voice channel when a session tears down.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelUsage {
    pub text_input_tokens: i64,
    pub text_output_tokens: i64,
    pub audio_input_seconds: f64,
    pub audio_output_seconds: f64,
}

/// Identity of the physical kiosk this process drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KioskIdentity {
    pub gym_id: String,
    #[serde(default)]
    pub franchise_id: Option<String>,
    pub kiosk_slug: String,
}

/// One step of the loading-progress sequence shown while a session starts.
/// Purely user feedback; not correctness-relevant state.
#[derive(Debug, Clone, Serialize)]
pub struct LoadingProgress {
    pub label: &'static str,
    pub percent: u8,
}

/// Named loading steps with monotonically increasing percentages.
pub const LOADING_STEPS: [LoadingProgress; 4] = [
    LoadingProgress { label: "Lecture du badge", percent: 15 },
    LoadingProgress { label: "Validation de l'adhésion", percent: 40 },
    LoadingProgress { label: "Connexion au canal vocal", percent: 70 },
    LoadingProgress { label: "Prêt", percent: 100 },
];
