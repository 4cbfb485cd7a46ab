//! Webhook payload parsing.
//!
//! The billing platform delivers JSON:API envelopes: the member resource
//! under `data` and a bag of related resources under `included`. Member
//! and pledge events share most attributes but differ in which fields are
//! required — member events always carry an email, pledge events always
//! carry a last charge date and may carry the next one. The optional
//! chat-identity reference rides in the included `user` resource's social
//! connections. Everything else in the envelope is ignored.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{ServiceError, ServiceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatronStatus {
    Active,
    Declined,
    Former,
    /// JSON null — a follower who has never pledged.
    NotSet,
}

impl PatronStatus {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("active_patron") => PatronStatus::Active,
            Some("declined_patron") => PatronStatus::Declined,
            Some("former_patron") => PatronStatus::Former,
            None => PatronStatus::NotSet,
            Some(other) => {
                log::warn!("[Webhook] Unknown patron_status {:?}", other);
                PatronStatus::NotSet
            }
        }
    }

    pub fn is_successful(self) -> bool {
        self == PatronStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeStatus {
    Paid,
    Declined,
    Deleted,
    Pending,
    Refunded,
    Fraud,
    Other,
}

impl ChargeStatus {
    /// The platform delivers mixed casing ("Paid", "Pending"); match
    /// case-insensitively and degrade unknown values to `Other`.
    fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.to_ascii_lowercase()).as_deref() {
            Some("paid") => ChargeStatus::Paid,
            Some("declined") => ChargeStatus::Declined,
            Some("deleted") => ChargeStatus::Deleted,
            Some("pending") => ChargeStatus::Pending,
            Some("refunded") => ChargeStatus::Refunded,
            Some("fraud") => ChargeStatus::Fraud,
            other => {
                if let Some(other) = other {
                    log::warn!("[Webhook] Unknown last_charge_status {:?}", other);
                }
                ChargeStatus::Other
            }
        }
    }

    pub fn is_successful(self) -> bool {
        self == ChargeStatus::Paid
    }
}

/// Parsed member.create / member.update / member.delete payload.
#[derive(Debug, Clone)]
pub struct MemberEventData {
    pub id: String,
    pub email: String,
    pub patron_status: PatronStatus,
    pub last_charge_status: ChargeStatus,
    pub last_charge_date: Option<DateTime<Utc>>,
    pub entitled_amount_cents: Option<i64>,
    /// Chat identity the member connected on the billing platform, if any.
    pub chat_user_id: Option<String>,
}

/// Parsed pledge.create / pledge.update / pledge.delete payload.
#[derive(Debug, Clone)]
pub struct PledgeEventData {
    pub id: String,
    pub email: Option<String>,
    pub patron_status: PatronStatus,
    pub last_charge_status: ChargeStatus,
    pub last_charge_date: DateTime<Utc>,
    pub next_charge_date: Option<DateTime<Utc>>,
    pub entitled_amount_cents: Option<i64>,
    pub chat_user_id: Option<String>,
}

// Wire shapes. Serde drops unknown fields, which covers the bulk of the
// JSON:API envelope we never look at.

#[derive(Debug, Deserialize)]
struct Envelope {
    data: ResourceData,
    #[serde(default)]
    included: Vec<IncludedResource>,
}

#[derive(Debug, Deserialize)]
struct ResourceData {
    id: String,
    attributes: Attributes,
}

#[derive(Debug, Default, Deserialize)]
struct Attributes {
    email: Option<String>,
    patron_status: Option<String>,
    last_charge_status: Option<String>,
    last_charge_date: Option<DateTime<Utc>>,
    next_charge_date: Option<DateTime<Utc>>,
    currently_entitled_amount_cents: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct IncludedResource {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    attributes: IncludedAttributes,
}

#[derive(Debug, Default, Deserialize)]
struct IncludedAttributes {
    social_connections: Option<SocialConnections>,
}

#[derive(Debug, Deserialize)]
struct SocialConnections {
    discord: Option<DiscordConnection>,
}

#[derive(Debug, Deserialize)]
struct DiscordConnection {
    user_id: Option<String>,
}

fn parse_envelope(body: &serde_json::Value) -> ServiceResult<Envelope> {
    serde_json::from_value(body.clone())
        .map_err(|e| ServiceError::MalformedEvent(format!("payload: {}", e)))
}

fn chat_user_id(envelope: &Envelope) -> Option<String> {
    envelope
        .included
        .iter()
        .find(|r| r.kind == "user")
        .and_then(|r| r.attributes.social_connections.as_ref())
        .and_then(|s| s.discord.as_ref())
        .and_then(|d| d.user_id.clone())
}

pub fn parse_member_payload(body: &serde_json::Value) -> ServiceResult<MemberEventData> {
    let envelope = parse_envelope(body)?;
    let chat_user_id = chat_user_id(&envelope);
    let attrs = envelope.data.attributes;

    let email = attrs
        .email
        .ok_or_else(|| ServiceError::MalformedEvent("member payload missing email".to_string()))?;

    Ok(MemberEventData {
        id: envelope.data.id,
        email,
        patron_status: PatronStatus::parse(attrs.patron_status.as_deref()),
        last_charge_status: ChargeStatus::parse(attrs.last_charge_status.as_deref()),
        last_charge_date: attrs.last_charge_date,
        entitled_amount_cents: attrs.currently_entitled_amount_cents,
        chat_user_id,
    })
}

pub fn parse_pledge_payload(body: &serde_json::Value) -> ServiceResult<PledgeEventData> {
    let envelope = parse_envelope(body)?;
    let chat_user_id = chat_user_id(&envelope);
    let attrs = envelope.data.attributes;

    let last_charge_date = attrs.last_charge_date.ok_or_else(|| {
        ServiceError::MalformedEvent("pledge payload missing last_charge_date".to_string())
    })?;

    Ok(PledgeEventData {
        id: envelope.data.id,
        email: attrs.email,
        patron_status: PatronStatus::parse(attrs.patron_status.as_deref()),
        last_charge_status: ChargeStatus::parse(attrs.last_charge_status.as_deref()),
        last_charge_date,
        next_charge_date: attrs.next_charge_date,
        entitled_amount_cents: attrs.currently_entitled_amount_cents,
        chat_user_id,
    })
}
