mod common;

use std::sync::Arc;

use common::{test_store, unloaded_raw};
use pathstore::{Item, ListParams, Queryable, SearchParams, SearchResult};

fn seed(store: &pathstore::PathStore) {
    store
        .mutate(|tx| {
            tx.put(
                "/messages/c",
                "Message C blah blah".to_string(),
                "Message C blah blah",
            )?;
            tx.put(
                "/messages/d",
                "Message D blah blah blah".to_string(),
                "Message D blah blah blah",
            )?;
            tx.put("/messages/a", "Message A blah".to_string(), "Message A blah")?;
            tx.put("/messages/b", "Message B".to_string(), "Message B")?;
            tx.put_all([
                ("/linktomessage/1", "/messages/d".to_string()),
                ("/linktomessage/2", "/messages/c".to_string()),
                ("/linktomessage/3", "/messages/b".to_string()),
                ("/linktomessage/4", "/messages/a".to_string()),
            ])
        })
        .expect("seed");
}

#[test]
fn test_search_with_highlighting() {
    let (_dir, store) = test_store();
    seed(&store);

    assert_eq!(
        store
            .search::<String>(
                &ListParams::prefix("/messages/%"),
                &SearchParams {
                    num_tokens: 7,
                    ..SearchParams::matching("bla*")
                },
            )
            .expect("search"),
        vec![
            SearchResult {
                item: Item::new("/messages/d", "", "Message D blah blah blah".to_string()),
                snippet: "...*bla*h *bla*h...".to_string(),
            },
            SearchResult {
                item: Item::new("/messages/c", "", "Message C blah blah".to_string()),
                snippet: "...*bla*h *bla*h".to_string(),
            },
            SearchResult {
                item: Item::new("/messages/a", "", "Message A blah".to_string()),
                snippet: "...ge A *bla*h".to_string(),
            },
        ],
        "prefix match with highlighting, best rank first"
    );
}

#[test]
fn test_rsearch_with_highlighting() {
    let (_dir, store) = test_store();
    seed(&store);
    let codec = Arc::clone(store.codec());

    assert_eq!(
        store
            .rsearch::<String>(
                &ListParams::prefix("/messages/%"),
                &SearchParams {
                    num_tokens: 7,
                    ..SearchParams::matching("bla*")
                },
            )
            .expect("rsearch"),
        vec![
            SearchResult {
                item: Item::new(
                    "/messages/d",
                    "",
                    unloaded_raw(&codec, &"Message D blah blah blah".to_string())
                ),
                snippet: "...*bla*h *bla*h...".to_string(),
            },
            SearchResult {
                item: Item::new(
                    "/messages/c",
                    "",
                    unloaded_raw(&codec, &"Message C blah blah".to_string())
                ),
                snippet: "...*bla*h *bla*h".to_string(),
            },
            SearchResult {
                item: Item::new(
                    "/messages/a",
                    "",
                    unloaded_raw(&codec, &"Message A blah".to_string())
                ),
                snippet: "...ge A *bla*h".to_string(),
            },
        ],
    );
}

#[test]
fn test_search_join_details() {
    let (_dir, store) = test_store();
    seed(&store);

    assert_eq!(
        store
            .search::<String>(
                &ListParams {
                    join_details: true,
                    ..ListParams::prefix("/linktomessage/%")
                },
                &SearchParams {
                    num_tokens: 7,
                    ..SearchParams::matching("bla*")
                },
            )
            .expect("search"),
        vec![
            SearchResult {
                item: Item::new(
                    "/linktomessage/1",
                    "/messages/d",
                    "Message D blah blah blah".to_string()
                ),
                snippet: "...*bla*h *bla*h...".to_string(),
            },
            SearchResult {
                item: Item::new(
                    "/linktomessage/2",
                    "/messages/c",
                    "Message C blah blah".to_string()
                ),
                snippet: "...*bla*h *bla*h".to_string(),
            },
            SearchResult {
                item: Item::new(
                    "/linktomessage/4",
                    "/messages/a",
                    "Message A blah".to_string()
                ),
                snippet: "...ge A *bla*h".to_string(),
            },
        ],
        "the match applies to the detail row, the index path is reported"
    );
}

#[test]
fn test_search_after_delete_and_update() {
    let (_dir, store) = test_store();
    seed(&store);

    store
        .mutate(|tx| {
            // Delete an entry, then add it back without full-text indexing:
            // its stale fts row must stay unreachable.
            tx.delete("/messages/d")?;
            tx.put("/messages/d", "Message D blah blah blah".to_string(), "")?;
            // Delete another entry outright, leaving its fts row orphaned.
            tx.delete("/messages/c")?;
            Ok(())
        })
        .expect("mutate");

    assert_eq!(
        store
            .search::<String>(
                &ListParams::prefix("/messages/%"),
                &SearchParams {
                    num_tokens: 1,
                    ..SearchParams::matching("blah")
                },
            )
            .expect("search"),
        vec![SearchResult {
            item: Item::new("/messages/a", "", "Message A blah".to_string()),
            snippet: "...*bla*...".to_string(),
        }],
        "results should exclude deleted rows and deleted fulltext"
    );

    // Updating the full text changes which terms hit.
    store
        .mutate(|tx| {
            tx.put(
                "/messages/a",
                "Message A is different now".to_string(),
                "Message A is different now",
            )
        })
        .expect("mutate");

    assert!(
        store
            .search::<String>(
                &ListParams::prefix("/messages/%"),
                &SearchParams::matching("blah"),
            )
            .expect("search")
            .is_empty(),
        "results exclude the replaced fulltext"
    );

    assert_eq!(
        store
            .search::<String>(
                &ListParams::prefix("/messages/%"),
                &SearchParams::matching("diff"),
            )
            .expect("search"),
        vec![SearchResult {
            item: Item::new("/messages/a", "", "Message A is different now".to_string()),
            snippet: "Message A is *diff*erent now".to_string(),
        }],
        "results include the new fulltext"
    );
}

#[test]
fn test_search_cjk_trigrams() {
    let (_dir, store) = test_store();
    let body = "北京2022年冬奥会在二月举行，吸引了来自世界各地的运动员参加各项冰雪赛事。";
    store
        .mutate(|tx| tx.put("/item", body.to_string(), body))
        .expect("mutate");

    let results = store
        .search::<String>(
            &ListParams::prefix("%"),
            &SearchParams {
                num_tokens: 7,
                ..SearchParams::matching("冬奥会")
            },
        )
        .expect("search");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].item.path, "/item");
    assert_eq!(results[0].item.value, body);
    assert!(
        results[0].snippet.contains("*冬奥会*"),
        "trigram tokenization should highlight the CJK match, got {:?}",
        results[0].snippet
    );
}
