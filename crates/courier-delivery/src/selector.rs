//! Delivery path selection

use courier_core::{ContactId, DeliveryPath, PeerReachability};

/// Pick the first tier to try for a contact
///
/// | online | direct | path             |
/// |--------|--------|------------------|
/// | yes    | yes    | Direct           |
/// | yes    | no     | Relay            |
/// | no     | -      | StoreAndForward  |
pub fn select_path(_contact_id: &ContactId, reachability: &PeerReachability) -> DeliveryPath {
    match (reachability.is_online, reachability.supports_direct) {
        (true, true) => DeliveryPath::Direct,
        (true, false) => DeliveryPath::Relay,
        (false, _) => DeliveryPath::StoreAndForward,
    }
}

/// Tiers to try in order, starting at `first`
pub fn escalation(first: DeliveryPath) -> impl Iterator<Item = DeliveryPath> {
    let mut next = Some(first);
    std::iter::from_fn(move || {
        let current = next?;
        next = current.is_live().then(|| current.fallback());
        Some(current)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn reach(is_online: bool, supports_direct: bool) -> PeerReachability {
        PeerReachability {
            contact_id: ContactId::from("bob"),
            is_online,
            supports_direct,
            last_seen_at: None,
        }
    }

    #[test]
    fn test_decision_table() {
        let bob = ContactId::from("bob");
        assert_eq!(select_path(&bob, &reach(true, true)), DeliveryPath::Direct);
        assert_eq!(select_path(&bob, &reach(true, false)), DeliveryPath::Relay);
        assert_eq!(select_path(&bob, &reach(false, true)), DeliveryPath::StoreAndForward);
        assert_eq!(select_path(&bob, &reach(false, false)), DeliveryPath::StoreAndForward);
    }

    #[test]
    fn test_escalation_order() {
        let tiers: Vec<_> = escalation(DeliveryPath::Direct).collect();
        assert_eq!(
            tiers,
            vec![DeliveryPath::Direct, DeliveryPath::Relay, DeliveryPath::StoreAndForward]
        );
        assert_eq!(
            escalation(DeliveryPath::StoreAndForward).collect::<Vec<_>>(),
            vec![DeliveryPath::StoreAndForward]
        );
    }

    proptest! {
        #[test]
        fn prop_online_direct_always_direct(contact in "[a-f0-9]{1,64}", last_seen in proptest::option::of(0i64..i64::MAX / 2)) {
            let reachability = PeerReachability {
                contact_id: ContactId::from(contact.as_str()),
                is_online: true,
                supports_direct: true,
                last_seen_at: last_seen.map(courier_core::Timestamp::from_millis),
            };
            prop_assert_eq!(
                select_path(&reachability.contact_id, &reachability),
                DeliveryPath::Direct
            );
        }

        #[test]
        fn prop_offline_always_store_and_forward(contact in "[a-f0-9]{1,64}", supports_direct in any::<bool>()) {
            let contact = ContactId::from(contact.as_str());
            let reachability = PeerReachability {
                contact_id: contact.clone(),
                is_online: false,
                supports_direct,
                last_seen_at: None,
            };
            prop_assert_eq!(select_path(&contact, &reachability), DeliveryPath::StoreAndForward);
        }
    }
}
