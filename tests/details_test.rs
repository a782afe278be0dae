mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use common::{loaded_raw, test_store, unloaded_raw};
use pathstore::{ChangeSet, Codec, Item, PathStore, Result, Subscription, Tx};

/// Seeds the index/detail fixture, subscribes with join-details, applies
/// `update` in a second transaction, and asserts the last delivered change
/// set.
fn check_detail_subscription(
    receive_initial: bool,
    expected: impl FnOnce(&Arc<Codec>) -> ChangeSet<i64>,
    update: impl FnOnce(&mut Tx) -> Result<()>,
) {
    let (_dir, store) = test_store();
    seed(&store);
    let codec = Arc::clone(store.codec());

    let last: Arc<Mutex<Option<ChangeSet<i64>>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&last);
    store
        .subscribe(
            Subscription::new("details", ["/index/%"], move |cs| {
                *slot.lock().expect("lock") = Some(cs);
                Ok(())
            })
            .receive_initial(receive_initial)
            .join_details(true),
        )
        .expect("subscribe");

    store.mutate(update).expect("update transaction");

    let delivered = last.lock().expect("lock").take();
    assert_eq!(delivered, Some(expected(&codec)));
}

fn seed(store: &PathStore) {
    store
        .mutate(|tx| {
            tx.put("/detail/1", 1i64, "")?;
            tx.put("/detail/2", 2i64, "")?;
            tx.put("/index/1", "/detail/1".to_string(), "")?;
            tx.put("/index/2", "/detail/2".to_string(), "")?;
            // Index entry pointing at a detail that does not exist yet.
            tx.put("/index/3", "/detail/3".to_string(), "")?;
            Ok(())
        })
        .expect("seed");
}

#[test]
fn test_initial_details_snapshot() {
    check_detail_subscription(
        true,
        |codec| {
            let mut expected = ChangeSet::default();
            expected.updates.insert(
                "/index/1".to_string(),
                Item::new("/index/1", "/detail/1", unloaded_raw(codec, &1i64)),
            );
            expected.updates.insert(
                "/index/2".to_string(),
                Item::new("/index/2", "/detail/2", unloaded_raw(codec, &2i64)),
            );
            // /index/3 is absent: its detail row does not exist.
            expected
        },
        |_tx| Ok(()),
    );
}

#[test]
fn test_detail_subscription_modify_details() {
    check_detail_subscription(
        false,
        |codec| {
            let mut expected = ChangeSet::default();
            expected.updates.insert(
                "/index/1".to_string(),
                Item::new("/index/1", "/detail/1", loaded_raw(codec, 11i64)),
            );
            expected.deletes = HashSet::from(["/index/2".to_string()]);
            expected
        },
        |tx| {
            tx.put("/detail/1", 11i64, "")?;
            tx.delete("/detail/2")?;
            Ok(())
        },
    );
}

#[test]
fn test_detail_subscription_modify_index() {
    check_detail_subscription(
        false,
        |codec| {
            let mut expected = ChangeSet::default();
            // The re-pointed index entry reports the newly referenced
            // detail, read back rather than carried by the commit.
            expected.updates.insert(
                "/index/1".to_string(),
                Item::new("/index/1", "/detail/2", unloaded_raw(codec, &2i64)),
            );
            // The detail row appearing late reports against the index entry
            // that has been waiting for it.
            expected.updates.insert(
                "/index/3".to_string(),
                Item::new("/index/3", "/detail/3", loaded_raw(codec, 3i64)),
            );
            expected.deletes = HashSet::from(["/index/2".to_string()]);
            expected
        },
        |tx| {
            tx.put("/index/1", "/detail/2".to_string(), "")?;
            tx.put("/detail/3", 3i64, "")?;
            tx.delete("/index/2")?;
            Ok(())
        },
    );
}

#[test]
fn test_armed_bindings_without_initial_delivery() {
    let (_dir, store) = test_store();
    seed(&store);
    let codec = Arc::clone(store.codec());

    let last: Arc<Mutex<Option<ChangeSet<i64>>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&last);
    store
        .subscribe(
            Subscription::new("armed", ["/index/%"], move |cs| {
                *slot.lock().expect("lock") = Some(cs);
                Ok(())
            })
            .join_details(true),
        )
        .expect("subscribe");

    // Without receive_initial nothing is delivered at registration...
    assert!(last.lock().expect("lock").is_none());

    // ...but the bookkeeping pass ran: a detail-only commit still reports
    // against the referring index path.
    store
        .mutate(|tx| tx.put("/detail/1", 5i64, ""))
        .expect("mutate");
    let delivered = last.lock().expect("lock").take().expect("change set");
    let mut expected = ChangeSet::default();
    expected.updates.insert(
        "/index/1".to_string(),
        Item::new("/index/1", "/detail/1", loaded_raw(&codec, 5i64)),
    );
    assert_eq!(delivered, expected);
}
