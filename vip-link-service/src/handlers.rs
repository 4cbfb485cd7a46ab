//! Webhook event handlers.
//!
//! One handler per classified event kind. Member events maintain the
//! billing-to-chat link; pledge events drive entitlement accrual across
//! every player linked to the paying chat identity. Delete events are
//! deliberate no-ops: entitlement lapses at its existing expiration and
//! identity rows are retained for history.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use vip_link_types::{GrantReport, LinkStatus, PlayerIdentity};

use crate::accrual::{accrue, REWARD_PERIOD_DAYS};
use crate::crcon::{VipApi, MISSING_PLAYER_NAME};
use crate::db::Db;
use crate::error::ServiceResult;
use crate::events::EventKind;
use crate::payload::{parse_member_payload, parse_pledge_payload, MemberEventData, PledgeEventData};

/// Result of processing one webhook event.
#[derive(Debug, Default)]
pub struct EventOutcome {
    /// Per-player reconciliation outcomes; empty for non-accruing events.
    pub grants: Vec<GrantReport>,
}

impl EventOutcome {
    fn none() -> Self {
        Self::default()
    }

    pub fn has_failures(&self) -> bool {
        self.grants.iter().any(|g| g.error.is_some())
    }
}

pub struct EventProcessor {
    db: Arc<Db>,
    vip_api: Arc<dyn VipApi>,
}

impl EventProcessor {
    pub fn new(db: Arc<Db>, vip_api: Arc<dyn VipApi>) -> Self {
        Self { db, vip_api }
    }

    /// Route a classified event to its handler.
    pub async fn process(
        &self,
        kind: EventKind,
        body: &serde_json::Value,
    ) -> ServiceResult<EventOutcome> {
        match kind {
            EventKind::MemberCreate | EventKind::MemberUpdate => {
                let data = parse_member_payload(body)?;
                self.handle_member_upsert(kind, data)
            }
            EventKind::MemberDelete => {
                // Billing and link records are retained; entitlement
                // expires on its own.
                log::info!("[Webhook] member.delete received, retaining records");
                Ok(EventOutcome::none())
            }
            EventKind::PledgeCreate | EventKind::PledgeUpdate => {
                let data = parse_pledge_payload(body)?;
                self.handle_pledge_upsert(data).await
            }
            EventKind::PledgeDelete => {
                // No immediate revocation; VIP lapses at the current expiration.
                log::info!("[Webhook] pledge.delete received, no entitlement change");
                Ok(EventOutcome::none())
            }
        }
    }

    /// Link the billing identity to the chat identity the member connected
    /// on the billing platform. Covers both "newly connected" and
    /// "changed account"; replacement reports the previous owner.
    fn handle_member_upsert(
        &self,
        kind: EventKind,
        data: MemberEventData,
    ) -> ServiceResult<EventOutcome> {
        let Some(chat_name) = data.chat_user_id else {
            log::info!(
                "[Webhook] {} for {}: no chat identity connected",
                kind.as_str(),
                data.id
            );
            return Ok(EventOutcome::none());
        };

        let report = self.db.link_billing(&chat_name, &data.id)?;
        match report.status {
            LinkStatus::Replaced => log::warn!(
                "[Webhook] Billing identity {} relinked to {} (previously {})",
                data.id,
                chat_name,
                report.previous_owner.as_deref().unwrap_or("unknown")
            ),
            _ => log::info!(
                "[Webhook] Billing identity {} linked to {} ({:?})",
                data.id,
                chat_name,
                report.status
            ),
        }

        Ok(EventOutcome::none())
    }

    /// Accrue entitlement for a paid pledge across every linked player.
    async fn handle_pledge_upsert(&self, data: PledgeEventData) -> ServiceResult<EventOutcome> {
        let now = Utc::now();

        let Some(targets) = self.db.grant_targets(&data.id)? else {
            log::warn!(
                "[Webhook] No billing identity for {}, nothing to extend",
                data.id
            );
            return Ok(EventOutcome::none());
        };

        if !(data.patron_status.is_successful() && data.last_charge_status.is_successful()) {
            log::info!(
                "[Webhook] Pledge for {} not accruing: patron_status={:?} last_charge_status={:?}",
                data.id,
                data.patron_status,
                data.last_charge_status
            );
            return Ok(EventOutcome::none());
        }

        let next_charge_date = data
            .next_charge_date
            .unwrap_or(data.last_charge_date + Duration::days(REWARD_PERIOD_DAYS));
        let earned = next_charge_date - now;
        if earned < Duration::zero() {
            log::error!(
                "[Webhook] Earned time for {} was negative ({}s), skipping",
                data.id,
                earned.num_seconds()
            );
            return Ok(EventOutcome::none());
        }

        let Some(chat) = targets.chat else {
            log::warn!(
                "[Webhook] Billing identity {} has no owning chat identity, nothing to extend",
                targets.billing.external_id
            );
            return Ok(EventOutcome::none());
        };

        if targets.players.is_empty() {
            // A paying patron with nothing to grant is worth surfacing.
            log::warn!(
                "[Webhook] {} has no linked player identities to extend entitlement for",
                chat.name
            );
            return Ok(EventOutcome::none());
        }

        let grants = join_all(
            targets
                .players
                .iter()
                .map(|player| self.grant_player(player, earned, now)),
        )
        .await;

        let failed = grants.iter().filter(|g| g.error.is_some()).count();
        if failed > 0 {
            log::error!(
                "[Webhook] Entitlement extension for {} failed for {}/{} players",
                chat.name,
                failed,
                grants.len()
            );
        }

        Ok(EventOutcome { grants })
    }

    /// Extend one player's entitlement. Failures are captured in the
    /// report so one player's outage never blocks the others.
    async fn grant_player(
        &self,
        player: &PlayerIdentity,
        earned: Duration,
        now: DateTime<Utc>,
    ) -> GrantReport {
        match self.try_grant(player, earned, now).await {
            Ok((previous, new)) => {
                log::info!(
                    "[Webhook] Extended entitlement for player_id={} {:?} -> {}",
                    player.external_id,
                    previous.map(|p| p.to_rfc3339()),
                    new.to_rfc3339()
                );
                GrantReport {
                    player_id: player.external_id.clone(),
                    previous_expiration: previous.map(|p| p.to_rfc3339()),
                    new_expiration: Some(new.to_rfc3339()),
                    error: None,
                }
            }
            Err(e) => {
                log::error!(
                    "[Webhook] Failed to extend entitlement for player_id={}: {}",
                    player.external_id,
                    e
                );
                GrantReport {
                    player_id: player.external_id.clone(),
                    previous_expiration: None,
                    new_expiration: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn try_grant(
        &self,
        player: &PlayerIdentity,
        earned: Duration,
        now: DateTime<Utc>,
    ) -> ServiceResult<(Option<DateTime<Utc>>, DateTime<Utc>)> {
        let state = self.vip_api.fetch_vip_state(&player.external_id).await?;
        let current = state.as_ref().and_then(|s| s.expiration);
        let name = state
            .and_then(|s| s.display_name)
            .unwrap_or_else(|| MISSING_PLAYER_NAME.to_string());

        let new_expiration = accrue(earned, current, now)?;
        self.vip_api
            .grant_vip(&player.external_id, &name, new_expiration)
            .await?;

        Ok((current, new_expiration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crcon::VipState;
    use crate::error::ServiceError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// Scripted upstream: per-player VIP states, recorded grants, and an
    /// optional set of players whose writes fail.
    #[derive(Default)]
    struct MockVipApi {
        states: Mutex<HashMap<String, VipState>>,
        grants: Mutex<Vec<(String, String, DateTime<Utc>)>>,
        failing: Mutex<HashSet<String>>,
    }

    impl MockVipApi {
        fn with_state(self, player_id: &str, state: VipState) -> Self {
            self.states
                .lock()
                .unwrap()
                .insert(player_id.to_string(), state);
            self
        }

        fn with_failing(self, player_id: &str) -> Self {
            self.failing.lock().unwrap().insert(player_id.to_string());
            self
        }

        fn recorded_grants(&self) -> Vec<(String, String, DateTime<Utc>)> {
            self.grants.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl VipApi for MockVipApi {
        async fn fetch_vip_state(&self, player_id: &str) -> ServiceResult<Option<VipState>> {
            Ok(self.states.lock().unwrap().get(player_id).cloned())
        }

        async fn grant_vip(
            &self,
            player_id: &str,
            description: &str,
            expiration: DateTime<Utc>,
        ) -> ServiceResult<()> {
            if self.failing.lock().unwrap().contains(player_id) {
                return Err(ServiceError::UpstreamUnavailable(format!(
                    "{} unreachable",
                    player_id
                )));
            }
            self.grants.lock().unwrap().push((
                player_id.to_string(),
                description.to_string(),
                expiration,
            ));
            Ok(())
        }
    }

    fn processor(db: Arc<Db>, api: Arc<MockVipApi>) -> EventProcessor {
        EventProcessor::new(db, api)
    }

    fn pledge_body(billing_id: &str, next_charge: Option<DateTime<Utc>>) -> serde_json::Value {
        json!({
            "data": {
                "attributes": {
                    "currently_entitled_amount_cents": 500,
                    "email": "patron@example.com",
                    "last_charge_date": "2024-01-31T20:46:10.000+00:00",
                    "last_charge_status": "Paid",
                    "next_charge_date": next_charge.map(|d| d.to_rfc3339()),
                    "patron_status": "active_patron"
                },
                "id": billing_id,
                "type": "member"
            },
            "included": []
        })
    }

    fn member_body(billing_id: &str, chat_user_id: Option<&str>) -> serde_json::Value {
        let included = match chat_user_id {
            Some(id) => json!([{
                "attributes": {
                    "social_connections": {"discord": {"url": null, "user_id": id}}
                },
                "id": "719414",
                "type": "user"
            }]),
            None => json!([]),
        };
        json!({
            "data": {
                "attributes": {
                    "email": "patron@example.com",
                    "last_charge_date": "2024-01-31T20:46:10.000+00:00",
                    "last_charge_status": "Paid",
                    "patron_status": "active_patron"
                },
                "id": billing_id,
                "type": "member"
            },
            "included": included
        })
    }

    fn assert_close(actual: DateTime<Utc>, expected: DateTime<Utc>) {
        let drift = (actual - expected).num_seconds().abs();
        assert!(drift < 5, "expected {} within 5s of {}", actual, expected);
    }

    #[tokio::test]
    async fn paid_pledge_extends_every_linked_player() {
        let db = Arc::new(Db::open(":memory:").expect("in-memory db"));
        db.link_billing("patron-a", "billing-1").unwrap();
        db.link_primary("patron-a", "fresh-player").unwrap();
        db.link_sponsored("patron-a", "vip-player").unwrap();

        let now = Utc::now();
        // One player with no current entitlement, one expiring in 5 days.
        let api = Arc::new(MockVipApi::default().with_state(
            "vip-player",
            VipState {
                expiration: Some(now + Duration::days(5)),
                display_name: Some("VipPlayer".to_string()),
            },
        ));

        let body = pledge_body("billing-1", Some(now + Duration::days(30)));
        let outcome = processor(db, api.clone())
            .process(EventKind::PledgeUpdate, &body)
            .await
            .unwrap();

        assert_eq!(outcome.grants.len(), 2);
        assert!(!outcome.has_failures());

        let grants = api.recorded_grants();
        assert_eq!(grants.len(), 2);

        let fresh = grants.iter().find(|g| g.0 == "fresh-player").unwrap();
        assert_close(fresh.2, now + Duration::days(30));
        // No profile upstream, so the placeholder name is written.
        assert_eq!(fresh.1, MISSING_PLAYER_NAME);

        let vip = grants.iter().find(|g| g.0 == "vip-player").unwrap();
        assert_close(vip.2, now + Duration::days(5) + Duration::days(30));
        assert_eq!(vip.1, "VipPlayer");
    }

    #[tokio::test]
    async fn pledge_create_delegates_to_update_handling() {
        let db = Arc::new(Db::open(":memory:").expect("in-memory db"));
        db.link_billing("patron-a", "billing-1").unwrap();
        db.link_primary("patron-a", "fresh-player").unwrap();

        let now = Utc::now();
        let api = Arc::new(MockVipApi::default());
        let body = pledge_body("billing-1", Some(now + Duration::days(30)));
        let outcome = processor(db, api.clone())
            .process(EventKind::PledgeCreate, &body)
            .await
            .unwrap();

        assert_eq!(outcome.grants.len(), 1);
        assert_eq!(api.recorded_grants().len(), 1);
    }

    #[tokio::test]
    async fn unknown_billing_identity_is_a_noop() {
        let db = Arc::new(Db::open(":memory:").expect("in-memory db"));
        let api = Arc::new(MockVipApi::default());

        let body = pledge_body("billing-unknown", Some(Utc::now() + Duration::days(30)));
        let outcome = processor(db, api.clone())
            .process(EventKind::PledgeUpdate, &body)
            .await
            .unwrap();

        assert!(outcome.grants.is_empty());
        assert!(api.recorded_grants().is_empty());
    }

    #[tokio::test]
    async fn unpaid_charge_does_not_accrue() {
        let db = Arc::new(Db::open(":memory:").expect("in-memory db"));
        db.link_billing("patron-a", "billing-1").unwrap();
        db.link_primary("patron-a", "fresh-player").unwrap();

        let api = Arc::new(MockVipApi::default());
        let mut body = pledge_body("billing-1", Some(Utc::now() + Duration::days(30)));
        body["data"]["attributes"]["last_charge_status"] = json!("Declined");

        let outcome = processor(db, api.clone())
            .process(EventKind::PledgeUpdate, &body)
            .await
            .unwrap();

        assert!(outcome.grants.is_empty());
        assert!(api.recorded_grants().is_empty());
    }

    #[tokio::test]
    async fn past_next_charge_date_is_skipped() {
        let db = Arc::new(Db::open(":memory:").expect("in-memory db"));
        db.link_billing("patron-a", "billing-1").unwrap();
        db.link_primary("patron-a", "fresh-player").unwrap();

        let api = Arc::new(MockVipApi::default());
        let body = pledge_body("billing-1", Some(Utc::now() - Duration::days(2)));

        let outcome = processor(db, api.clone())
            .process(EventKind::PledgeUpdate, &body)
            .await
            .unwrap();

        assert!(outcome.grants.is_empty());
        assert!(api.recorded_grants().is_empty());
    }

    #[tokio::test]
    async fn one_player_failing_does_not_block_the_other() {
        let db = Arc::new(Db::open(":memory:").expect("in-memory db"));
        db.link_billing("patron-a", "billing-1").unwrap();
        db.link_primary("patron-a", "healthy-player").unwrap();
        db.link_sponsored("patron-a", "broken-player").unwrap();

        let now = Utc::now();
        let api = Arc::new(MockVipApi::default().with_failing("broken-player"));
        let body = pledge_body("billing-1", Some(now + Duration::days(30)));

        let outcome = processor(db, api.clone())
            .process(EventKind::PledgeUpdate, &body)
            .await
            .unwrap();

        assert_eq!(outcome.grants.len(), 2);
        assert!(outcome.has_failures());

        // The healthy player's write still landed.
        let grants = api.recorded_grants();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].0, "healthy-player");

        let broken = outcome
            .grants
            .iter()
            .find(|g| g.player_id == "broken-player")
            .unwrap();
        assert!(broken.error.is_some());
    }

    #[tokio::test]
    async fn patron_with_no_players_is_logged_not_failed() {
        let db = Arc::new(Db::open(":memory:").expect("in-memory db"));
        db.link_billing("patron-a", "billing-1").unwrap();

        let api = Arc::new(MockVipApi::default());
        let body = pledge_body("billing-1", Some(Utc::now() + Duration::days(30)));

        let outcome = processor(db, api.clone())
            .process(EventKind::PledgeUpdate, &body)
            .await
            .unwrap();

        assert!(outcome.grants.is_empty());
        assert!(!outcome.has_failures());
    }

    #[tokio::test]
    async fn missing_next_charge_date_defaults_to_reward_period() {
        let db = Arc::new(Db::open(":memory:").expect("in-memory db"));
        db.link_billing("patron-a", "billing-1").unwrap();
        db.link_primary("patron-a", "fresh-player").unwrap();

        let api = Arc::new(MockVipApi::default());
        let mut body = pledge_body("billing-1", None);
        // Recent charge so the defaulted next charge date is in the future.
        let last_charge = Utc::now() - Duration::days(1);
        body["data"]["attributes"]["last_charge_date"] = json!(last_charge.to_rfc3339());

        let outcome = processor(db, api.clone())
            .process(EventKind::PledgeUpdate, &body)
            .await
            .unwrap();

        assert_eq!(outcome.grants.len(), 1);
        let grants = api.recorded_grants();
        // earned = (last_charge + 30d) - now ≈ 29d from a 1-day-old charge.
        assert_close(grants[0].2, last_charge + Duration::days(REWARD_PERIOD_DAYS));
    }

    #[tokio::test]
    async fn member_update_links_billing_to_connected_chat() {
        let db = Arc::new(Db::open(":memory:").expect("in-memory db"));
        let api = Arc::new(MockVipApi::default());

        let body = member_body("billing-1", Some("patron-a"));
        processor(db.clone(), api)
            .process(EventKind::MemberUpdate, &body)
            .await
            .unwrap();

        let billing = db
            .find_billing_by_external_id("billing-1")
            .unwrap()
            .expect("billing created");
        assert!(billing.chat_id.is_some());
    }

    #[tokio::test]
    async fn member_update_without_chat_reference_is_a_noop() {
        let db = Arc::new(Db::open(":memory:").expect("in-memory db"));
        let api = Arc::new(MockVipApi::default());

        let body = member_body("billing-1", None);
        processor(db.clone(), api)
            .process(EventKind::MemberCreate, &body)
            .await
            .unwrap();

        assert!(db.find_billing_by_external_id("billing-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn member_delete_retains_the_billing_link() {
        let db = Arc::new(Db::open(":memory:").expect("in-memory db"));
        db.link_billing("patron-a", "billing-1").unwrap();
        let api = Arc::new(MockVipApi::default());

        let body = member_body("billing-1", Some("patron-a"));
        processor(db.clone(), api)
            .process(EventKind::MemberDelete, &body)
            .await
            .unwrap();

        let billing = db
            .find_billing_by_external_id("billing-1")
            .unwrap()
            .expect("billing retained");
        assert!(billing.chat_id.is_some());
    }
}
