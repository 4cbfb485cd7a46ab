//! Linking operations over the identity store.
//!
//! Each operation runs inside one transaction: chat and player identities
//! are materialized on first reference, conflicts resolve by replacement
//! with the previous owner reported, and re-linking an identical pair is
//! an unchanged no-op rather than a conflict. Partial writes are never
//! observable.

use vip_link_types::{LinkReport, UnlinkReport};

use crate::db::{self, Db};
use crate::error::{ServiceError, ServiceResult};

impl Db {
    /// Link a player as the chat identity's one primary player.
    ///
    /// If another chat identity currently holds the player as primary,
    /// that link is removed and its owner reported. The caller's own
    /// previous primary link, if any, is retargeted so the one-primary-
    /// per-chat rule keeps holding.
    pub fn link_primary(&self, chat_name: &str, player_external_id: &str) -> ServiceResult<LinkReport> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let chat = db::get_or_create_chat(&tx, chat_name)?;
        let player = db::get_or_create_player(&tx, player_external_id)?;

        let report = match db::find_primary_owner_of_player(&tx, player.id)? {
            Some(owner) if owner.id == chat.id => {
                tx.commit()?;
                return Ok(LinkReport::unchanged());
            }
            Some(owner) => {
                db::delete_primary_link_of_player(&tx, player.id)?;
                log::warn!(
                    "[Links] Primary link for player {} moved from {} to {}",
                    player_external_id,
                    owner.name,
                    chat_name
                );
                LinkReport::replaced(owner.name)
            }
            None => {
                log::info!(
                    "[Links] Linking player {} as primary for {}",
                    player_external_id,
                    chat_name
                );
                LinkReport::created()
            }
        };

        if db::retarget_primary_link(&tx, chat.id, player.id)? == 0 {
            db::insert_link(&tx, chat.id, player.id, true)?;
        }

        tx.commit()?;
        Ok(report)
    }

    /// Remove the chat identity's primary link, returning the unlinked
    /// player's external id. The player identity row is retained.
    pub fn unlink_primary(&self, chat_name: &str) -> ServiceResult<UnlinkReport> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let chat = db::get_or_create_chat(&tx, chat_name)?;

        let removed = match db::find_primary_player_of_chat(&tx, chat.id)? {
            Some(player) => {
                db::delete_primary_link_of_chat(&tx, chat.id)?;
                log::warn!(
                    "[Links] Unlinked primary player {} from {}",
                    player.external_id,
                    chat_name
                );
                Some(player.external_id)
            }
            None => {
                log::warn!(
                    "[Links] Tried to unlink primary for {} but none was linked",
                    chat_name
                );
                None
            }
        };

        tx.commit()?;
        Ok(UnlinkReport { removed })
    }

    /// Add a sponsored link. A chat identity may sponsor any number of
    /// players and a player may be sponsored by any number of chats;
    /// nothing is ever displaced.
    pub fn link_sponsored(
        &self,
        chat_name: &str,
        player_external_id: &str,
    ) -> ServiceResult<LinkReport> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let chat = db::get_or_create_chat(&tx, chat_name)?;
        let player = db::get_or_create_player(&tx, player_external_id)?;

        let report = if db::sponsored_link_exists(&tx, chat.id, player.id)? {
            log::warn!(
                "[Links] Player {} is already sponsored by {}",
                player_external_id,
                chat_name
            );
            LinkReport::unchanged()
        } else {
            db::insert_link(&tx, chat.id, player.id, false)?;
            log::info!(
                "[Links] Linking player {} as sponsored for {}",
                player_external_id,
                chat_name
            );
            LinkReport::created()
        };

        tx.commit()?;
        Ok(report)
    }

    /// Remove exactly the matching sponsored link; no-op when absent.
    pub fn unlink_sponsored(
        &self,
        chat_name: &str,
        player_external_id: &str,
    ) -> ServiceResult<UnlinkReport> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let chat = db::get_or_create_chat(&tx, chat_name)?;

        let player = db::find_player_by_external_id(&tx, player_external_id)?
            .ok_or_else(|| ServiceError::NotFound(format!("player identity {}", player_external_id)));
        let removed = match player {
            Ok(player) => {
                if db::delete_sponsored_link(&tx, chat.id, player.id)? > 0 {
                    log::warn!(
                        "[Links] Unlinked sponsored player {} from {}",
                        player_external_id,
                        chat_name
                    );
                    Some(player.external_id)
                } else {
                    log::warn!(
                        "[Links] Tried to unlink sponsored player {} from {} but it was not linked",
                        player_external_id,
                        chat_name
                    );
                    None
                }
            }
            // Unknown player identity: recovered locally as a no-op.
            Err(e) => {
                log::warn!("[Links] {} while unlinking sponsored for {}", e, chat_name);
                None
            }
        };

        tx.commit()?;
        Ok(UnlinkReport { removed })
    }

    /// Tie a billing identity to a chat identity. A billing identity has
    /// one owner at most; re-linking under a different owner replaces the
    /// ownership and reports the previous owner.
    pub fn link_billing(
        &self,
        chat_name: &str,
        billing_external_id: &str,
    ) -> ServiceResult<LinkReport> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let chat = db::get_or_create_chat(&tx, chat_name)?;

        let report = match db::find_billing_by_external_id(&tx, billing_external_id)? {
            None => {
                db::create_billing(&tx, chat.id, billing_external_id)?;
                LinkReport::created()
            }
            Some(billing) if billing.chat_id == Some(chat.id) => LinkReport::unchanged(),
            Some(billing) => {
                let previous = match billing.chat_id {
                    Some(previous_chat_id) => db::find_chat_by_id(&tx, previous_chat_id)?,
                    None => None,
                };
                db::set_billing_owner(&tx, billing.id, Some(chat.id))?;
                match previous {
                    Some(previous) => {
                        log::warn!(
                            "[Links] Billing identity {} moved from {} to {}",
                            billing_external_id,
                            previous.name,
                            chat_name
                        );
                        LinkReport::replaced(previous.name)
                    }
                    None => {
                        log::info!(
                            "[Links] Billing identity {} adopted by {}",
                            billing_external_id,
                            chat_name
                        );
                        LinkReport::created()
                    }
                }
            }
        };

        tx.commit()?;
        Ok(report)
    }

    /// Detach the billing identity owned by this chat identity, returning
    /// its external id. The billing row is retained for history.
    pub fn unlink_billing(&self, chat_name: &str) -> ServiceResult<UnlinkReport> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let chat = db::get_or_create_chat(&tx, chat_name)?;

        let removed = match db::find_billing_by_owner(&tx, chat.id)? {
            Some(billing) => {
                db::set_billing_owner(&tx, billing.id, None)?;
                log::warn!(
                    "[Links] Unlinked billing identity {} from {}",
                    billing.external_id,
                    chat_name
                );
                Some(billing.external_id)
            }
            None => {
                log::warn!(
                    "[Links] Tried to unlink billing for {} but none was linked",
                    chat_name
                );
                None
            }
        };

        tx.commit()?;
        Ok(UnlinkReport { removed })
    }
}
