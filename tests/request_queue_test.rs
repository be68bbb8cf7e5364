//! Request queue semantics through the public API.

use spiderling::{Request, RequestQueue};

#[tokio::test]
async fn duplicate_add_preserves_state_and_retry_count() {
    let queue = RequestQueue::in_memory();
    queue
        .add_request(Request::new("https://a/x").with_unique_key("K"), false)
        .await
        .expect("add");

    // Lease it, bump its retry count, put it back.
    let mut leased = queue
        .fetch_next_request()
        .await
        .expect("fetch")
        .expect("available");
    leased.retry_count = 2;
    queue.reclaim_request(leased, false).await.expect("reclaim");

    // A duplicate add must not reset the stored record.
    let dup = queue
        .add_request(Request::new("https://a/x").with_unique_key("K"), false)
        .await
        .expect("add");
    assert!(dup.was_already_present);
    assert!(!dup.was_already_handled);

    let again = queue
        .fetch_next_request()
        .await
        .expect("fetch")
        .expect("available");
    assert_eq!(again.retry_count, 2);
}

#[tokio::test]
async fn forefront_then_normal_ordering_matches_insert_priority() {
    let queue = RequestQueue::in_memory();
    queue
        .add_request(Request::new("https://a/normal-1"), false)
        .await
        .expect("add");
    queue
        .add_request(Request::new("https://a/normal-2"), false)
        .await
        .expect("add");
    queue
        .add_request(Request::new("https://a/front-1"), true)
        .await
        .expect("add");
    queue
        .add_request(Request::new("https://a/front-2"), true)
        .await
        .expect("add");

    let mut served = Vec::new();
    while let Some(request) = queue.fetch_next_request().await.expect("fetch") {
        served.push(request.url.clone());
        queue.mark_request_handled(request).await.expect("handled");
    }

    // Later forefront inserts cut ahead of earlier ones; normal inserts
    // keep arrival order.
    assert_eq!(
        served,
        vec![
            "https://a/front-2".to_string(),
            "https://a/front-1".to_string(),
            "https://a/normal-1".to_string(),
            "https://a/normal-2".to_string(),
        ]
    );
}

#[tokio::test]
async fn forefront_re_add_promotes_existing_request() {
    let queue = RequestQueue::in_memory();
    queue
        .add_request(Request::new("https://a/1"), false)
        .await
        .expect("add");
    queue
        .add_request(Request::new("https://a/2"), false)
        .await
        .expect("add");

    // Re-adding an unhandled request with forefront moves it up.
    let promoted = queue
        .add_request(Request::new("https://a/2"), true)
        .await
        .expect("add");
    assert!(promoted.was_already_present);

    let first = queue
        .fetch_next_request()
        .await
        .expect("fetch")
        .expect("available");
    assert_eq!(first.url, "https://a/2");
}

#[tokio::test]
async fn handled_duplicate_is_not_served_again() {
    let queue = RequestQueue::in_memory();
    queue
        .add_request(Request::new("https://a/x").with_unique_key("K"), false)
        .await
        .expect("add");

    let leased = queue
        .fetch_next_request()
        .await
        .expect("fetch")
        .expect("available");
    queue.mark_request_handled(leased).await.expect("handled");

    let dup = queue
        .add_request(Request::new("https://a/x").with_unique_key("K"), false)
        .await
        .expect("add");
    assert!(dup.was_already_present);
    assert!(dup.was_already_handled);
    assert!(queue.fetch_next_request().await.expect("fetch").is_none());
}

#[tokio::test]
async fn batch_add_deduplicates_within_batch() {
    let queue = RequestQueue::in_memory();
    let results = queue
        .batch_add_requests(
            vec![
                Request::new("https://a/1"),
                Request::new("https://a/1"),
                Request::new("https://a/2"),
            ],
            false,
        )
        .await
        .expect("batch add");

    assert_eq!(results.len(), 3);
    assert!(!results[0].was_already_present);
    assert!(results[1].was_already_present);
    assert_eq!(queue.total_count().await.expect("count"), 2);
}
