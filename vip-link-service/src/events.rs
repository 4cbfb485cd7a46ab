//! Webhook event classification.
//!
//! The event header is a `:`-delimited triple of resource, optional
//! sub-resource, and action (`members:update`, `members:pledge:create`).
//! Classification is a pure function of the header and never touches the
//! request body. Shape failures are `MalformedEvent`; well-shaped headers
//! outside the handled set are `Unmatched`.

use crate::error::{ServiceError, ServiceResult};

pub const EVENT_DELIMITER: char = ':';

const RESOURCE_MEMBER: &str = "members";
const SUB_RESOURCE_PLEDGE: &str = "pledge";

/// The closed set of handled webhook events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    MemberCreate,
    MemberUpdate,
    MemberDelete,
    PledgeCreate,
    PledgeUpdate,
    PledgeDelete,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::MemberCreate => "member.create",
            EventKind::MemberUpdate => "member.update",
            EventKind::MemberDelete => "member.delete",
            EventKind::PledgeCreate => "pledge.create",
            EventKind::PledgeUpdate => "pledge.update",
            EventKind::PledgeDelete => "pledge.delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create" => Some(Action::Create),
            "update" => Some(Action::Update),
            "delete" => Some(Action::Delete),
            _ => None,
        }
    }
}

/// Classify an event header into one of the six handled kinds.
pub fn classify(header: &str) -> ServiceResult<EventKind> {
    let segments: Vec<&str> = header.split(EVENT_DELIMITER).collect();

    match segments.as_slice() {
        [resource, action] => {
            // A two-segment header must end in an action; a trailing
            // sub-resource ("members:pledge") is a missing-action shape.
            let action = Action::parse(action)
                .ok_or_else(|| ServiceError::MalformedEvent(header.to_string()))?;
            match (*resource, action) {
                (RESOURCE_MEMBER, Action::Create) => Ok(EventKind::MemberCreate),
                (RESOURCE_MEMBER, Action::Update) => Ok(EventKind::MemberUpdate),
                (RESOURCE_MEMBER, Action::Delete) => Ok(EventKind::MemberDelete),
                _ => Err(ServiceError::Unmatched(header.to_string())),
            }
        }
        [resource, sub_resource, action] => {
            match (*resource, *sub_resource, Action::parse(action)) {
                (RESOURCE_MEMBER, SUB_RESOURCE_PLEDGE, Some(Action::Create)) => {
                    Ok(EventKind::PledgeCreate)
                }
                (RESOURCE_MEMBER, SUB_RESOURCE_PLEDGE, Some(Action::Update)) => {
                    Ok(EventKind::PledgeUpdate)
                }
                (RESOURCE_MEMBER, SUB_RESOURCE_PLEDGE, Some(Action::Delete)) => {
                    Ok(EventKind::PledgeDelete)
                }
                _ => Err(ServiceError::Unmatched(header.to_string())),
            }
        }
        _ => Err(ServiceError::MalformedEvent(header.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_member_events() {
        assert_eq!(classify("members:create").unwrap(), EventKind::MemberCreate);
        assert_eq!(classify("members:update").unwrap(), EventKind::MemberUpdate);
        assert_eq!(classify("members:delete").unwrap(), EventKind::MemberDelete);
    }

    #[test]
    fn classifies_pledge_events() {
        assert_eq!(
            classify("members:pledge:create").unwrap(),
            EventKind::PledgeCreate
        );
        assert_eq!(
            classify("members:pledge:update").unwrap(),
            EventKind::PledgeUpdate
        );
        assert_eq!(
            classify("members:pledge:delete").unwrap(),
            EventKind::PledgeDelete
        );
    }

    #[test]
    fn missing_action_is_malformed() {
        let err = classify("members:pledge").unwrap_err();
        assert!(matches!(err, ServiceError::MalformedEvent(_)));
    }

    #[test]
    fn unknown_triple_is_unmatched() {
        let err = classify("foo:bar:baz").unwrap_err();
        assert!(matches!(err, ServiceError::Unmatched(_)));
    }

    #[test]
    fn unknown_resource_with_valid_action_is_unmatched() {
        let err = classify("campaigns:create").unwrap_err();
        assert!(matches!(err, ServiceError::Unmatched(_)));
    }

    #[test]
    fn wrong_segment_counts_are_malformed() {
        assert!(matches!(
            classify("members").unwrap_err(),
            ServiceError::MalformedEvent(_)
        ));
        assert!(matches!(
            classify("members:pledge:update:extra").unwrap_err(),
            ServiceError::MalformedEvent(_)
        ));
        assert!(matches!(
            classify("").unwrap_err(),
            ServiceError::MalformedEvent(_)
        ));
    }
}
