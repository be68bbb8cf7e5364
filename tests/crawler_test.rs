//! End-to-end crawler runs against in-memory storage.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use spiderling::{
    Crawler, CrawlerConfig, CriticalError, Dataset, MemoryDataset, MemoryKeyValueStore,
    Middleware, NonRetryableError, Request, RetryRequestError, extension,
};

fn fast_config() -> spiderling::CrawlerConfigBuilder {
    let _ = env_logger::builder().is_test(true).try_init();
    CrawlerConfig::builder()
        .maybe_run_interval_millis(10)
        .persist_state_interval_secs(3600)
        .logging_interval_secs(3600)
}

#[tokio::test(start_paused = true)]
async fn retry_twice_then_succeed_fills_histogram() {
    let attempts = Arc::new(AtomicU32::new(0));
    let handler_attempts = Arc::clone(&attempts);

    let config = fast_config()
        .max_request_retries(3)
        .build()
        .expect("valid config");
    let crawler = Crawler::builder(config)
        .default_handler(move |_ctx| {
            let attempts = Arc::clone(&handler_attempts);
            Box::pin(async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= 2 {
                    anyhow::bail!("transient failure on attempt {attempt}")
                }
                Ok(())
            })
        })
        .build();

    let stats = crawler
        .run(vec![Request::new("https://a/1")])
        .await
        .expect("run should finish");

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(stats.requests_finished, 1);
    assert_eq!(stats.requests_failed, 0);
    assert_eq!(stats.requests_retries, 2);
    // Succeeded after exactly two retries.
    assert_eq!(stats.retry_histogram, vec![0, 0, 1]);
    assert_eq!(crawler.stats().retry_error_total(), 2);
    assert_eq!(crawler.stats().final_error_total(), 0);
}

#[tokio::test(start_paused = true)]
async fn zero_retries_makes_first_failure_final() {
    let config = fast_config()
        .max_request_retries(0)
        .build()
        .expect("valid config");
    let failed_urls: Arc<parking_lot::Mutex<Vec<String>>> =
        Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = Arc::clone(&failed_urls);

    let crawler = Crawler::builder(config)
        .default_handler(|_ctx| Box::pin(async { anyhow::bail!("always fails") }))
        .failed_request_handler(move |ctx, err| {
            let seen = Arc::clone(&seen);
            let url = ctx.request.url.clone();
            assert!(err.to_string().contains("always fails"));
            Box::pin(async move {
                seen.lock().push(url);
                Ok(())
            })
        })
        .build();

    let stats = crawler
        .run(vec![Request::new("https://a/1")])
        .await
        .expect("run should finish");

    assert_eq!(stats.requests_finished, 0);
    assert_eq!(stats.requests_failed, 1);
    assert_eq!(stats.requests_retries, 0);
    assert_eq!(*failed_urls.lock(), vec!["https://a/1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn non_retryable_error_skips_remaining_budget() {
    let attempts = Arc::new(AtomicU32::new(0));
    let handler_attempts = Arc::clone(&attempts);

    let config = fast_config()
        .max_request_retries(5)
        .build()
        .expect("valid config");
    let crawler = Crawler::builder(config)
        .default_handler(move |_ctx| {
            let attempts = Arc::clone(&handler_attempts);
            Box::pin(async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(NonRetryableError::new("permanently broken").into())
            })
        })
        .build();

    let stats = crawler
        .run(vec![Request::new("https://a/1")])
        .await
        .expect("run should finish");

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(stats.requests_failed, 1);
    assert_eq!(stats.requests_retries, 0);
}

#[tokio::test(start_paused = true)]
async fn retry_request_overrides_exhausted_budget() {
    let attempts = Arc::new(AtomicU32::new(0));
    let handler_attempts = Arc::clone(&attempts);

    let config = fast_config()
        .max_request_retries(0)
        .build()
        .expect("valid config");
    let crawler = Crawler::builder(config)
        .default_handler(move |_ctx| {
            let attempts = Arc::clone(&handler_attempts);
            Box::pin(async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= 2 {
                    return Err(RetryRequestError::new("try again regardless").into());
                }
                Ok(())
            })
        })
        .build();

    let stats = crawler
        .run(vec![Request::new("https://a/1")])
        .await
        .expect("run should finish");

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(stats.requests_finished, 1);
    assert_eq!(stats.requests_retries, 2);
}

#[tokio::test(start_paused = true)]
async fn no_retry_wins_over_retry_request() {
    let attempts = Arc::new(AtomicU32::new(0));
    let handler_attempts = Arc::clone(&attempts);

    let config = fast_config()
        .max_request_retries(3)
        .build()
        .expect("valid config");
    let crawler = Crawler::builder(config)
        .default_handler(move |_ctx| {
            let attempts = Arc::clone(&handler_attempts);
            Box::pin(async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(RetryRequestError::new("try again regardless").into())
            })
        })
        .build();

    let stats = crawler
        .run(vec![Request::new("https://a/1").with_no_retry(true)])
        .await
        .expect("run should finish");

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(stats.requests_finished, 0);
    assert_eq!(stats.requests_failed, 1);
    assert_eq!(stats.requests_retries, 0);
}

#[tokio::test(start_paused = true)]
async fn critical_error_aborts_the_whole_crawl() {
    let config = fast_config().build().expect("valid config");
    let crawler = Crawler::builder(config)
        .default_handler(|_ctx| {
            Box::pin(async { Err(CriticalError::new("out of disk").into()) })
        })
        .build();

    let requests = vec![Request::new("https://a/1"), Request::new("https://a/2")];
    let err = crawler.run(requests).await.expect_err("run should abort");
    assert!(err.to_string().contains("out of disk"));
}

#[tokio::test(start_paused = true)]
async fn dispatch_cap_processes_exactly_n_requests() {
    let config = fast_config()
        .max_requests_per_crawl(10)
        .desired_concurrency(4)
        .max_concurrency(4)
        .build()
        .expect("valid config");
    let crawler = Crawler::builder(config)
        .default_handler(|_ctx| Box::pin(async { Ok(()) }))
        .build();

    let requests: Vec<Request> = (0..100)
        .map(|i| Request::new(format!("https://a/{i}")))
        .collect();
    let stats = crawler.run(requests).await.expect("run should finish");

    assert_eq!(stats.requests_finished, 10);
    assert_eq!(stats.requests_failed, 0);

    // The other ninety stay unhandled in the queue.
    let queue = crawler.request_queue();
    assert_eq!(queue.handled_count().await.expect("count"), 10);
    assert_eq!(queue.total_count().await.expect("count"), 100);
}

#[tokio::test(start_paused = true)]
async fn finite_load_terminates_with_conserved_counts() {
    let config = fast_config()
        .max_request_retries(2)
        .desired_concurrency(3)
        .build()
        .expect("valid config");
    let crawler = Crawler::builder(config)
        .default_handler(|ctx| {
            let doomed = ctx.request.url.contains("bad");
            Box::pin(async move {
                if doomed {
                    anyhow::bail!("this one never works")
                }
                Ok(())
            })
        })
        .build();

    let mut requests = Vec::new();
    for i in 0..15 {
        requests.push(Request::new(format!("https://a/ok/{i}")));
    }
    for i in 0..5 {
        requests.push(Request::new(format!("https://a/bad/{i}")));
    }

    let stats = crawler.run(requests).await.expect("run should finish");

    assert_eq!(stats.requests_finished, 15);
    assert_eq!(stats.requests_failed, 5);
    assert_eq!(stats.requests_total, 20);
    // Each doomed request burned its full retry budget.
    assert_eq!(stats.requests_retries, 10);
    assert!(crawler.request_queue().is_finished().await.expect("finished"));
}

#[tokio::test(start_paused = true)]
async fn handler_results_flow_into_the_dataset() {
    let dataset = MemoryDataset::shared();
    let kv = MemoryKeyValueStore::shared();

    let config = fast_config().build().expect("valid config");
    let crawler = Crawler::builder(config)
        .kv_store(kv)
        .dataset(Arc::clone(&dataset) as Arc<dyn Dataset>)
        .default_handler(|ctx| {
            Box::pin(async move {
                let item = serde_json::json!({ "url": ctx.request.url });
                ctx.push_data(item).await
            })
        })
        .build();

    crawler
        .run(vec![Request::new("https://a/1"), Request::new("https://a/2")])
        .await
        .expect("run should finish");

    let items = dataset.get_data(0, 10).await.expect("read");
    assert_eq!(items.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn middleware_extensions_reach_the_handler_and_clean_up() {
    struct FetchedBody(String);

    let cleanups = Arc::new(AtomicU32::new(0));
    let cleanup_counter = Arc::clone(&cleanups);

    let body_middleware = Middleware::new("fake_fetch", |ctx: &spiderling::CrawlingContext| {
        let url = ctx.request.url.clone();
        Box::pin(async move { Ok(extension(FetchedBody(format!("<html>{url}</html>")))) })
    })
    .with_cleanup(move |_ctx, _err| {
        let counter = Arc::clone(&cleanup_counter);
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    });

    let config = fast_config().build().expect("valid config");
    let crawler = Crawler::builder(config)
        .middleware(body_middleware)
        .default_handler(|ctx| {
            Box::pin(async move {
                let body = ctx
                    .extensions
                    .get::<FetchedBody>()
                    .expect("middleware ran before the handler");
                anyhow::ensure!(body.0.contains("https://a/1"));
                Ok(())
            })
        })
        .build();

    let stats = crawler
        .run(vec![Request::new("https://a/1")])
        .await
        .expect("run should finish");

    assert_eq!(stats.requests_finished, 1);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn handler_enqueued_requests_are_crawled_too() {
    let config = fast_config().build().expect("valid config");
    let crawler = Crawler::builder(config)
        .default_handler(|ctx| {
            let is_seed = ctx.request.url.ends_with("/seed");
            Box::pin(async move {
                if is_seed {
                    ctx.add_requests(vec![
                        Request::new("https://a/child/1"),
                        Request::new("https://a/child/2"),
                    ])
                    .await?;
                }
                Ok(())
            })
        })
        .build();

    let stats = crawler
        .run(vec![Request::new("https://a/seed")])
        .await
        .expect("run should finish");

    assert_eq!(stats.requests_finished, 3);
}
