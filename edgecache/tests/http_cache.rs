use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edgecache::backend::{Backend, Origin};
use edgecache::error::SendErrorCause;
use edgecache::http::purge::purge_surrogate_key;
use edgecache::{Host, Request, Response};
use edgecache_host::MemoryCache;

type Respond = Box<dyn Fn(&Request) -> Response + Send + Sync>;

/// An origin that counts fetches and answers each after `delay`.
struct TestOrigin {
    fetches: AtomicUsize,
    delay: Duration,
    respond: Respond,
}

#[async_trait]
impl Origin for TestOrigin {
    async fn fetch(&self, req: Request) -> Result<Response, anyhow::Error> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok((self.respond)(&req))
    }
}

impl TestOrigin {
    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

fn setup(
    delay: Duration,
    respond: impl Fn(&Request) -> Response + Send + Sync + 'static,
) -> (Host, Backend, Arc<TestOrigin>) {
    let origin = Arc::new(TestOrigin {
        fetches: AtomicUsize::new(0),
        delay,
        respond: Box::new(respond),
    });
    let dyn_origin: Arc<dyn Origin> = origin.clone();
    let backend = Backend::new("test_origin", dyn_origin).unwrap();
    let host = Host::from_store(Arc::new(MemoryCache::new()));
    (host, backend, origin)
}

fn hello(_: &Request) -> Response {
    Response::from_body("hello world!").with_header("cache-control", "max-age=60")
}

const URI: &str = "http://example.com/hello";

#[tokio::test(start_paused = true)]
async fn miss_then_hit() {
    let (host, backend, origin) = setup(Duration::ZERO, hello);

    let resp = Request::get(URI).send(&host, &backend).await.unwrap();
    assert!(!resp.is_from_cache());
    assert_eq!(resp.get_header_str("x-cache"), Some("MISS"));
    assert_eq!(resp.get_ttl(), Some(Duration::from_secs(60)));
    assert_eq!(resp.into_body_str().await.unwrap(), "hello world!");

    let resp = Request::get(URI).send(&host, &backend).await.unwrap();
    assert!(resp.is_from_cache());
    assert_eq!(resp.get_header_str("x-cache"), Some("HIT"));
    assert!(resp.get_hits().unwrap() >= 1);
    assert_eq!(resp.into_body_str().await.unwrap(), "hello world!");
    assert_eq!(origin.fetches(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_collapse() {
    let (host, backend, origin) = setup(Duration::from_millis(100), hello);
    let before_send = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..6)
        .map(|_| {
            let (host, backend) = (host.clone(), backend.clone());
            let before_send = Arc::clone(&before_send);
            tokio::spawn(async move {
                let resp = Request::get(URI)
                    .with_before_send(move |_| {
                        before_send.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .send(&host, &backend)
                    .await
                    .unwrap();
                let from_cache = resp.is_from_cache();
                (from_cache, resp.into_body_str().await.unwrap())
            })
        })
        .collect();

    let mut fetched = 0;
    for task in tasks {
        let (from_cache, body) = task.await.unwrap();
        assert_eq!(body, "hello world!");
        if !from_cache {
            fetched += 1;
        }
    }
    assert_eq!(fetched, 1);
    assert_eq!(origin.fetches(), 1);
    assert_eq!(before_send.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn before_send_modifies_the_backend_request() {
    let (host, backend, _) = setup(Duration::ZERO, |req| {
        Response::from_body(req.get_header_str("authorization").unwrap_or("none").to_owned())
    });
    let resp = Request::get(URI)
        .with_before_send(|req| {
            req.set_header("authorization", "token");
            Ok(())
        })
        .send(&host, &backend)
        .await
        .unwrap();
    assert_eq!(resp.into_body_str().await.unwrap(), "token");
}

#[tokio::test(start_paused = true)]
async fn hook_failures_are_shared() {
    let (host, backend, origin) = setup(Duration::from_millis(100), hello);
    let producer = {
        let (host, backend) = (host.clone(), backend.clone());
        tokio::spawn(async move {
            Request::get(URI)
                .with_after_send(|_| Err(anyhow::anyhow!("rejected by policy")))
                .send(&host, &backend)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let waiter = Request::get(URI).send(&host, &backend).await;

    let err = producer.await.unwrap().unwrap_err();
    assert!(matches!(err.root_cause(), SendErrorCause::AfterSend(_)));
    assert_eq!(err.backend_name(), "test_origin");
    match waiter.unwrap_err().root_cause() {
        SendErrorCause::Collapsed(reason) => assert!(reason.contains("rejected by policy")),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(origin.fetches(), 1);
}

#[tokio::test(start_paused = true)]
async fn uncacheable_responses_are_refetched() {
    let (host, backend, origin) = setup(Duration::ZERO, hello);
    let after_send = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let after_send = Arc::clone(&after_send);
        let resp = Request::get(URI)
            .with_after_send(move |candidate| {
                after_send.fetch_add(1, Ordering::SeqCst);
                candidate.set_uncacheable();
                Ok(())
            })
            .send(&host, &backend)
            .await
            .unwrap();
        assert!(!resp.is_from_cache());
        assert_eq!(resp.into_body_str().await.unwrap(), "hello world!");
    }
    assert_eq!(origin.fetches(), 2);
    assert_eq!(after_send.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn disabled_collapsing_runs_hooks_per_request() {
    let (host, backend, origin) = setup(Duration::from_millis(100), hello);
    let after_send = Arc::new(AtomicUsize::new(0));
    let send = |host: Host, backend: Backend, after_send: Arc<AtomicUsize>| async move {
        Request::get(URI)
            .with_after_send(move |candidate| {
                after_send.fetch_add(1, Ordering::SeqCst);
                candidate.set_uncacheable_disable_collapsing();
                Ok(())
            })
            .send(&host, &backend)
            .await
            .unwrap()
    };

    let first = send(host.clone(), backend.clone(), Arc::clone(&after_send)).await;
    assert!(!first.is_from_cache());

    let tasks: Vec<_> = (0..3)
        .map(|_| tokio::spawn(send(host.clone(), backend.clone(), Arc::clone(&after_send))))
        .collect();
    for task in tasks {
        let resp = task.await.unwrap();
        assert!(!resp.is_from_cache());
        assert_eq!(resp.into_body_str().await.unwrap(), "hello world!");
    }
    assert_eq!(origin.fetches(), 4);
    assert_eq!(after_send.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn set_cookie_disables_collapsing_by_default() {
    let (host, backend, origin) = setup(Duration::ZERO, |_| {
        Response::from_body("personal").with_header("set-cookie", "session=1")
    });
    for _ in 0..2 {
        let resp = Request::get(URI).send(&host, &backend).await.unwrap();
        assert!(!resp.is_from_cache());
        assert_eq!(resp.get_header_str("set-cookie"), Some("session=1"));
    }
    assert_eq!(origin.fetches(), 2);
}

#[tokio::test(start_paused = true)]
async fn vary_caches_each_variant() {
    let (host, backend, origin) = setup(Duration::ZERO, |req| {
        let lang = req.get_header_str("accept-language").unwrap_or("none").to_owned();
        Response::from_body(lang)
            .with_header("cache-control", "max-age=60")
            .with_header("vary", "accept-language")
    });
    let get = |lang: &'static str| {
        Request::get(URI)
            .with_header("accept-language", lang)
            .send(&host, &backend)
    };

    for lang in ["en", "fr"] {
        let resp = get(lang).await.unwrap();
        assert!(!resp.is_from_cache());
        assert_eq!(resp.into_body_str().await.unwrap(), lang);
    }
    for lang in ["en", "fr"] {
        let resp = get(lang).await.unwrap();
        assert!(resp.is_from_cache());
        assert_eq!(resp.get_vary(), Some("accept-language"));
        assert_eq!(resp.into_body_str().await.unwrap(), lang);
    }
    assert_eq!(origin.fetches(), 2);
}

#[tokio::test(start_paused = true)]
async fn body_transform_applies_to_cache_and_response() {
    let (host, backend, origin) = setup(Duration::ZERO, hello);
    let uppercase = |req: Request| {
        req.with_after_send(|candidate| {
            candidate.set_body_transform(|chunk| Ok(chunk.to_ascii_uppercase().into()));
            Ok(())
        })
    };

    let resp = uppercase(Request::get(URI)).send(&host, &backend).await.unwrap();
    assert_eq!(resp.into_body_str().await.unwrap(), "HELLO WORLD!");
    let resp = Request::get(URI).send(&host, &backend).await.unwrap();
    assert!(resp.is_from_cache());
    assert_eq!(resp.into_body_str().await.unwrap(), "HELLO WORLD!");
    assert_eq!(origin.fetches(), 1);
}

#[tokio::test(start_paused = true)]
async fn failing_transform_fails_the_body() {
    let (host, backend, _) = setup(Duration::ZERO, hello);
    let failing = |req: Request, cacheable: bool| {
        req.with_after_send(move |candidate| {
            if !cacheable {
                candidate.set_uncacheable();
            }
            candidate.set_body_transform(|_| Err(anyhow::anyhow!("bad chunk")));
            Ok(())
        })
    };

    let resp = failing(Request::get(URI), true).send(&host, &backend).await.unwrap();
    assert!(resp.into_body_bytes().await.is_err());

    let resp = failing(Request::get("http://example.com/private"), false)
        .send(&host, &backend)
        .await
        .unwrap();
    let err = resp.into_body_bytes().await.unwrap_err();
    assert!(err.to_string().contains("bad chunk"));
}

#[tokio::test(start_paused = true)]
async fn after_send_edits_headers_and_policy() {
    let (host, backend, _) = setup(Duration::ZERO, |_| {
        Response::from_body("hello world!")
            .with_header("x-internal", "secret")
            .with_header("surrogate-key", "page-1 section-a")
    });
    let resp = Request::get(URI)
        .with_after_send(|candidate| {
            candidate.remove_header("x-internal");
            candidate.set_header("x-policy", "edited");
            candidate.set_ttl(Duration::from_secs(300));
            candidate.set_stale_while_revalidate(Duration::from_secs(30));
            Ok(())
        })
        .send(&host, &backend)
        .await
        .unwrap();
    assert!(!resp.contains_header("x-internal"));
    assert!(!resp.contains_header("surrogate-key"));
    assert_eq!(resp.get_ttl(), Some(Duration::from_secs(300)));
    assert_eq!(resp.into_body_str().await.unwrap(), "hello world!");

    let resp = Request::get(URI).send(&host, &backend).await.unwrap();
    assert!(resp.is_from_cache());
    assert!(!resp.contains_header("x-internal"));
    assert_eq!(resp.get_header_str("x-policy"), Some("edited"));
    assert_eq!(
        resp.get_stale_while_revalidate(),
        Some(Duration::from_secs(30))
    );
    let keys: Vec<&str> = resp.get_surrogate_keys().unwrap().collect();
    assert!(keys.contains(&"page-1"));
    assert!(keys.contains(&"section-a"));
}

#[tokio::test(start_paused = true)]
async fn surrogate_key_purge_evicts_responses() {
    let (host, backend, origin) = setup(Duration::ZERO, |_| {
        Response::from_body("hello world!")
            .with_header("cache-control", "max-age=60")
            .with_header("surrogate-key", "page-1")
    });
    Request::get(URI).send(&host, &backend).await.unwrap();
    assert!(Request::get(URI)
        .send(&host, &backend)
        .await
        .unwrap()
        .is_from_cache());

    purge_surrogate_key(&host, "page-1").unwrap();
    let resp = Request::get(URI).send(&host, &backend).await.unwrap();
    assert!(!resp.is_from_cache());
    assert_eq!(origin.fetches(), 2);
}

#[tokio::test(start_paused = true)]
async fn pass_skips_the_cache_and_hooks() {
    let (host, backend, origin) = setup(Duration::ZERO, hello);
    let hooks = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let (before, after) = (Arc::clone(&hooks), Arc::clone(&hooks));
        let resp = Request::get(URI)
            .with_pass(true)
            .with_before_send(move |_| {
                before.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .with_after_send(move |_| {
                after.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .send(&host, &backend)
            .await
            .unwrap();
        assert!(!resp.is_from_cache());
        assert_eq!(resp.get_hits(), None);
    }
    assert_eq!(origin.fetches(), 2);
    assert_eq!(hooks.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn non_get_requests_bypass_the_cache() {
    let (host, backend, origin) = setup(Duration::ZERO, hello);
    for _ in 0..2 {
        let resp = Request::post(URI).send(&host, &backend).await.unwrap();
        assert!(!resp.is_from_cache());
    }
    assert_eq!(origin.fetches(), 2);
}

#[tokio::test(start_paused = true)]
async fn cache_key_override_shares_entries() {
    let (host, backend, origin) = setup(Duration::ZERO, hello);
    let key = vec![7u8; 32];
    for uri in ["http://example.com/a", "http://example.com/b"] {
        Request::get(uri)
            .with_cache_key(key.clone())
            .unwrap()
            .send(&host, &backend)
            .await
            .unwrap()
            .into_body_str()
            .await
            .unwrap();
    }
    assert_eq!(origin.fetches(), 1);
    assert!(Request::get(URI).with_cache_key(vec![0u8; 5]).is_err());
}

#[tokio::test(start_paused = true)]
async fn stale_responses_revalidate_in_the_background() {
    let (host, backend, origin) = setup(Duration::ZERO, |_| {
        Response::from_body("hello world!")
            .with_header("cache-control", "max-age=1, stale-while-revalidate=60")
    });
    Request::get(URI).send(&host, &backend).await.unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;

    let resp = Request::get(URI).send(&host, &backend).await.unwrap();
    assert!(resp.is_from_cache());
    assert_eq!(resp.into_body_str().await.unwrap(), "hello world!");

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(origin.fetches(), 2);
    let resp = Request::get(URI).send(&host, &backend).await.unwrap();
    assert!(resp.is_from_cache());
    assert!(resp.get_age().unwrap() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn relative_uris_are_rejected() {
    let (host, backend, origin) = setup(Duration::ZERO, hello);
    let err = Request::get("/relative").send(&host, &backend).await.unwrap_err();
    assert!(matches!(err.root_cause(), SendErrorCause::InvalidRequest(_)));
    assert_eq!(origin.fetches(), 0);
}

#[tokio::test(start_paused = true)]
async fn head_then_get() {
    let (host, backend, origin) = setup(Duration::ZERO, |req| {
        let body = if req.get_method() == "HEAD" { "" } else { "hello world!" };
        Response::from_body(body).with_header("cache-control", "max-age=60")
    });

    let resp = Request::head(URI).send(&host, &backend).await.unwrap();
    assert!(!resp.is_from_cache());
    assert_eq!(resp.get_ttl(), Some(Duration::from_secs(60)));
    assert_eq!(resp.into_body_str().await.unwrap(), "");

    let resp = Request::get(URI).send(&host, &backend).await.unwrap();
    assert!(resp.is_from_cache());
    assert_eq!(resp.into_body_str().await.unwrap(), "hello world!");

    let resp = Request::head(URI).send(&host, &backend).await.unwrap();
    assert!(resp.is_from_cache());
    assert_eq!(resp.into_body_str().await.unwrap(), "");
    assert_eq!(origin.fetches(), 1);
}

#[tokio::test(start_paused = true)]
async fn revalidation_keeps_surrogate_keys() {
    let (host, backend, origin) = setup(Duration::ZERO, |req| {
        if req.contains_header("if-none-match") {
            return Response::from_status(304).with_header("cache-control", "max-age=60");
        }
        Response::from_body("hello world!")
            .with_header("cache-control", "max-age=1")
            .with_header("etag", "\"v1\"")
            .with_header("surrogate-key", "page-1")
    });
    Request::get(URI).send(&host, &backend).await.unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;

    let resp = Request::get(URI).send(&host, &backend).await.unwrap();
    assert_eq!(resp.into_body_str().await.unwrap(), "hello world!");
    assert_eq!(origin.fetches(), 2);

    let resp = Request::get(URI).send(&host, &backend).await.unwrap();
    assert!(resp.is_from_cache());
    assert_eq!(resp.get_ttl(), Some(Duration::from_secs(60)));
    let keys: Vec<&str> = resp.get_surrogate_keys().unwrap().collect();
    assert!(keys.contains(&"page-1"));
    assert_eq!(resp.into_body_str().await.unwrap(), "hello world!");

    purge_surrogate_key(&host, "page-1").unwrap();
    let resp = Request::get(URI).send(&host, &backend).await.unwrap();
    assert!(!resp.is_from_cache());
    assert_eq!(origin.fetches(), 3);
}

#[tokio::test(start_paused = true)]
async fn storage_failures_are_shared() {
    let (host, backend, origin) = setup(Duration::from_millis(100), |_| {
        Response::from_body("hello world!")
            .with_header("cache-control", "max-age=60")
            .with_header("x-large", "a".repeat(20 * 1024))
    });
    let producer = {
        let (host, backend) = (host.clone(), backend.clone());
        tokio::spawn(async move { Request::get(URI).send(&host, &backend).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let waiter = Request::get(URI).send(&host, &backend).await;

    let err = producer.await.unwrap().unwrap_err();
    assert!(matches!(err.root_cause(), SendErrorCause::Cache(_)));
    assert!(matches!(
        waiter.unwrap_err().root_cause(),
        SendErrorCause::Collapsed(_)
    ));
    assert_eq!(origin.fetches(), 1);
}
