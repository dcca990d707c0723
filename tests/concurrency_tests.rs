//! Concurrent Begin/End behavior: two racing starts must produce exactly one
//! base-layer capture of the true original identity.

use std::sync::Arc;

use masquerade::identity::{
    FacetKind, FacetSet, IdentityRef, OverlayShape, SessionOverlay, SessionRecord, TargetSpec,
};
use masquerade::store::memory::MemoryStore;
use masquerade::store::AccountLinks;

const SESSION: &str = "http://ex/session/1";

fn r(uri: &str, id: &str) -> IdentityRef {
    IdentityRef::new(uri, id)
}

fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.seed_session(
        SESSION,
        SessionRecord {
            session_id: "s1".into(),
            active: FacetSet {
                account: Some(r("http://ex/account/1", "a1")),
                membership: Some(r("http://ex/membership/1", "m1")),
                ..Default::default()
            },
            original: None,
        },
    );
    for n in [2, 3] {
        let account = store.seed_facet(FacetKind::Account, &format!("a{n}"), &format!("http://ex/account/{n}"));
        store.seed_account_links(
            &account.uri,
            AccountLinks {
                membership: Some(r(&format!("http://ex/membership/{n}"), &format!("m{n}"))),
                ..Default::default()
            },
        );
    }
    store
}

fn target(id: &str) -> TargetSpec {
    TargetSpec { account: Some(id.to_string()), ..Default::default() }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_begins_capture_exactly_one_original() {
    for _ in 0..50 {
        let store = seeded_store();
        let overlay = Arc::new(SessionOverlay::new(store.clone(), OverlayShape::AccountMembership));

        let target_a2 = target("a2");
        let target_a3 = target("a3");
        let (left, right) = futures::join!(
            overlay.begin(SESSION, &target_a2),
            overlay.begin(SESSION, &target_a3),
        );
        left.unwrap();
        right.unwrap();

        let rec = store.record(SESSION).unwrap();
        // Whichever call committed last, the original must be the identity
        // from before either call started.
        let original = rec.original.expect("an impersonation must be active");
        assert_eq!(original.account.as_ref().unwrap().external_id, "a1");
        assert_eq!(original.membership.as_ref().unwrap().external_id, "m1");
        let active_id = rec.active.account.as_ref().unwrap().external_id.clone();
        assert!(active_id == "a2" || active_id == "a3");

        // And the restore still round-trips to the pre-race state.
        overlay.end(SESSION).await.unwrap();
        let rec = store.record(SESSION).unwrap();
        assert_eq!(rec.active.account.as_ref().unwrap().external_id, "a1");
        assert!(rec.original.is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_begin_and_end_settle_into_a_consistent_state() {
    for _ in 0..50 {
        let store = seeded_store();
        let overlay = Arc::new(SessionOverlay::new(store.clone(), OverlayShape::AccountMembership));
        overlay.begin(SESSION, &target("a2")).await.unwrap();

        let target_a3 = target("a3");
        let (begin, end) = futures::join!(
            overlay.begin(SESSION, &target_a3),
            overlay.end(SESSION),
        );
        begin.unwrap();
        end.unwrap();

        // Either order is fine; the invariants are not negotiable: at most
        // one original layer, and it is always the pre-impersonation one.
        let rec = store.record(SESSION).unwrap();
        match rec.original {
            Some(original) => {
                assert_eq!(original.account.as_ref().unwrap().external_id, "a1");
                assert_eq!(rec.active.account.as_ref().unwrap().external_id, "a3");
            }
            None => {
                assert_eq!(rec.active.account.as_ref().unwrap().external_id, "a1");
            }
        }
    }
}
