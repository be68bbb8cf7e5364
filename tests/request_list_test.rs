//! Request list: remote sources, persistence and restart semantics.

use std::sync::Arc;

use spiderling::storage::{request_list_sources_key, request_list_state_key};
use spiderling::{KeyValueStore, MemoryKeyValueStore, Request, RequestList, RequestListSource};

fn kv() -> Arc<MemoryKeyValueStore> {
    MemoryKeyValueStore::shared()
}

#[tokio::test]
async fn downloads_remote_sources_one_url_per_line() {
    let mut server = mockito::Server::new_async().await;
    let body = "https://a/1\nhttps://a/2\nnot-a-url\nhttps://a/3\n";
    let mock = server
        .mock("GET", "/urls.txt")
        .with_status(200)
        .with_body(body)
        .create_async()
        .await;

    let list = RequestList::new(vec![RequestListSource::RequestsFromUrl {
        list_url: format!("{}/urls.txt", server.url()),
        url_pattern: None,
    }]);
    list.initialize().await.expect("initialize");

    mock.assert_async().await;
    assert_eq!(list.len(), 3);
    let first = list.fetch_next_request().expect("first");
    assert_eq!(first.url, "https://a/1");
}

#[tokio::test]
async fn download_failure_surfaces_as_error() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/urls.txt")
        .with_status(500)
        .create_async()
        .await;

    let list = RequestList::new(vec![RequestListSource::RequestsFromUrl {
        list_url: format!("{}/urls.txt", server.url()),
        url_pattern: None,
    }]);

    let err = list.initialize().await.expect_err("500 must fail");
    assert!(err.to_string().contains("urls.txt"));
}

#[tokio::test]
async fn named_list_persists_sources_and_state() {
    let kv = kv();
    let list = RequestList::new(vec![RequestListSource::Requests(vec![
        Request::new("https://a/1"),
        Request::new("https://a/2"),
        Request::new("https://a/3"),
    ])])
    .with_name("LINKS")
    .with_kv_store(Arc::clone(&kv) as Arc<dyn KeyValueStore>);
    list.initialize().await.expect("initialize");

    // Work through one request, leave one in flight.
    let first = list.fetch_next_request().expect("first");
    list.mark_request_handled(&first);
    let _second = list.fetch_next_request().expect("second");
    list.persist_state().await.expect("persist");

    assert!(
        kv.get_value(&request_list_sources_key("LINKS"))
            .await
            .expect("kv read")
            .is_some()
    );
    assert!(
        kv.get_value(&request_list_state_key("LINKS"))
            .await
            .expect("kv read")
            .is_some()
    );

    // A restarted list resumes: the handled request is gone, the in-flight
    // one is served again, the untouched one still follows.
    let restarted = RequestList::new(vec![RequestListSource::Requests(vec![
        Request::new("https://a/1"),
        Request::new("https://a/2"),
        Request::new("https://a/3"),
    ])])
    .with_name("LINKS")
    .with_kv_store(Arc::clone(&kv) as Arc<dyn KeyValueStore>);
    restarted.initialize().await.expect("initialize");

    let mut served = Vec::new();
    while let Some(request) = restarted.fetch_next_request() {
        served.push(request.url.clone());
        restarted.mark_request_handled(&request);
    }
    assert_eq!(served, vec!["https://a/2".to_string(), "https://a/3".to_string()]);
    assert!(restarted.is_finished());
}

#[tokio::test]
async fn state_without_sources_is_fatal() {
    let kv = kv();
    // Simulate a state left behind while the sources key was cleared.
    kv.set_value(
        &request_list_state_key("STALE"),
        serde_json::json!({"nextIndex": 1, "inProgress": [], "reclaimed": []}),
    )
    .await
    .expect("seed state");

    let list = RequestList::new(vec![RequestListSource::Requests(vec![Request::new(
        "https://a/1",
    )])])
    .with_name("STALE")
    .with_kv_store(Arc::clone(&kv) as Arc<dyn KeyValueStore>);

    let err = list.initialize().await.expect_err("co-version violation");
    assert!(err.to_string().contains("persisted state but no persisted sources"));
}
