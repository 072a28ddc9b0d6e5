use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use edgecache::cache::core::{self, CacheError, CacheKey, Transaction};
use edgecache::http::purge::{purge_surrogate_key, soft_purge_surrogate_key};
use edgecache::Host;
use edgecache_host::MemoryCache;

const TTL: Duration = Duration::from_secs(60);

fn host() -> Host {
    Host::from_store(Arc::new(MemoryCache::new()))
}

fn key(name: &'static str) -> CacheKey {
    Bytes::from_static(name.as_bytes())
}

async fn insert_str(host: &Host, name: &'static str, contents: &str) {
    let mut writer = core::insert(host, key(name), TTL).execute().unwrap();
    writer.write_all(contents.as_bytes()).unwrap();
    writer.finish().unwrap();
}

#[tokio::test]
async fn lookup_misses_then_hits() {
    let host = host();
    assert!(core::lookup(&host, key("k")).execute().await.unwrap().is_none());

    insert_str(&host, "k", "my cached object").await;
    let found = core::lookup(&host, key("k")).execute().await.unwrap().unwrap();
    assert_eq!(found.key(), &key("k"));
    assert_eq!(found.ttl(), TTL);
    assert!(!found.is_stale());
    assert!(found.is_usable());
    assert_eq!(found.known_length(), Some(16));
    assert_eq!(
        found.to_stream().unwrap().into_string().await.unwrap(),
        "my cached object"
    );
}

#[tokio::test]
async fn insert_metadata_is_visible() {
    let host = host();
    let mut writer = core::insert(&host, key("k"), TTL)
        .surrogate_keys(["one", "two"])
        .user_metadata(Bytes::from_static(b"meta"))
        .stale_while_revalidate(Duration::from_secs(5))
        .sensitive_data(true)
        .known_length(3)
        .execute()
        .unwrap();
    writer.write_all(b"abc").unwrap();
    writer.finish().unwrap();

    let found = core::lookup(&host, key("k")).execute().await.unwrap().unwrap();
    let mut keys: Vec<&str> = found.surrogate_keys().collect();
    keys.sort_unstable();
    assert_eq!(keys, ["one", "two"]);
    assert_eq!(found.user_metadata(), "meta");
    assert_eq!(found.stale_while_revalidate(), Duration::from_secs(5));
    assert!(found.is_sensitive_data());
}

#[tokio::test]
async fn variants_are_selected_by_request_headers() {
    let host = host();
    for lang in ["en", "fr"] {
        let mut writer = core::insert(&host, key("k"), TTL)
            .header("accept-language", lang)
            .vary_by([&http::header::ACCEPT_LANGUAGE])
            .execute()
            .unwrap();
        writer.write_all(lang.as_bytes()).unwrap();
        writer.finish().unwrap();
    }
    for lang in ["en", "fr"] {
        let found = core::lookup(&host, key("k"))
            .header("accept-language", lang)
            .execute()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.vary_rule(), "accept-language");
        assert_eq!(found.to_stream().unwrap().into_string().await.unwrap(), lang);
    }
    assert!(core::lookup(&host, key("k"))
        .header("accept-language", "de")
        .execute()
        .await
        .unwrap()
        .is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_transaction_is_obligated() {
    let host = host();
    let obligated = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let host = host.clone();
        let obligated = Arc::clone(&obligated);
        tasks.push(tokio::spawn(async move {
            let tx = Transaction::lookup(&host, key("k")).execute().await.unwrap();
            if tx.must_insert() {
                obligated.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                let mut writer = tx.insert(TTL).execute().unwrap();
                writer.write_str("produced once").unwrap();
                writer.finish().unwrap();
                return;
            }
            let found = tx.found().unwrap();
            assert_eq!(
                found.to_stream().unwrap().into_string().await.unwrap(),
                "produced once"
            );
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(obligated.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn waiters_stream_while_the_object_is_written() {
    let host = host();
    let tx = Transaction::lookup(&host, key("k")).execute().await.unwrap();
    assert!(tx.must_insert());

    let waiter = {
        let host = host.clone();
        tokio::spawn(async move {
            let tx = Transaction::lookup(&host, key("k")).execute().await.unwrap();
            assert!(!tx.must_insert_or_update());
            tx.found().unwrap().to_stream().unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let (mut writer, found) = tx.insert(TTL).execute_and_stream_back().unwrap();
    writer.write_str("hello ").unwrap();
    let mut body = waiter.await.unwrap();
    assert_eq!(body.read_chunk().await.unwrap().unwrap(), "hello ");

    writer.write_str("world").unwrap();
    writer.finish().unwrap();
    assert_eq!(body.into_string().await.unwrap(), "world");
    assert_eq!(
        found.to_stream().unwrap().into_string().await.unwrap(),
        "hello world"
    );
}

#[tokio::test(start_paused = true)]
async fn abandoned_inserts_fail_readers() {
    let host = host();
    let tx = Transaction::lookup(&host, key("k")).execute().await.unwrap();
    let (mut writer, found) = tx.insert(TTL).execute_and_stream_back().unwrap();
    writer.write_str("partial").unwrap();
    drop(writer);
    assert!(found.to_stream().unwrap().into_bytes().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn cancel_hands_the_obligation_to_a_waiter() {
    let host = host();
    let first = Transaction::lookup(&host, key("k")).execute().await.unwrap();
    assert!(first.must_insert());

    let waiter = {
        let host = host.clone();
        tokio::spawn(async move { Transaction::lookup(&host, key("k")).execute().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    first.cancel_insert_or_update().unwrap();
    assert!(!first.must_insert_or_update());
    // Nothing left to cancel.
    assert!(matches!(
        first.cancel_insert_or_update(),
        Err(CacheError::InvalidOperation)
    ));

    let second = waiter.await.unwrap().unwrap();
    assert!(second.must_insert());
}

#[tokio::test(start_paused = true)]
async fn cancel_promotes_exactly_one_of_many_waiters() {
    let host = host();
    let first = Transaction::lookup(&host, key("k")).execute().await.unwrap();
    let mut waiters: Vec<_> = (0..4)
        .map(|_| {
            let host = host.clone();
            tokio::spawn(async move { Transaction::lookup(&host, key("k")).execute().await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(waiters.iter().all(|waiter| !waiter.is_finished()));

    first.cancel_insert_or_update().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let promoted = waiters
        .iter()
        .position(|waiter| waiter.is_finished())
        .unwrap();
    assert_eq!(waiters.iter().filter(|waiter| waiter.is_finished()).count(), 1);

    let producer = waiters.remove(promoted).await.unwrap().unwrap();
    assert!(producer.must_insert());
    let mut writer = producer.insert(TTL).execute().unwrap();
    writer.write_str("second try").unwrap();
    writer.finish().unwrap();

    for waiter in waiters {
        let tx = waiter.await.unwrap().unwrap();
        assert!(!tx.must_insert_or_update());
        assert_eq!(
            tx.found().unwrap().to_stream().unwrap().into_string().await.unwrap(),
            "second try"
        );
    }
}

#[tokio::test]
async fn cancel_without_waiters_leaves_the_key_empty() {
    let host = host();
    let first = Transaction::lookup(&host, key("k")).execute().await.unwrap();
    first.cancel_insert_or_update().unwrap();
    assert!(!first.must_insert_or_update());

    assert!(core::lookup(&host, key("k")).execute().await.unwrap().is_none());
    let next = Transaction::lookup(&host, key("k")).execute().await.unwrap();
    assert!(next.must_insert());
    assert!(next.found().is_none());
}

#[tokio::test(start_paused = true)]
async fn dropping_an_obligated_transaction_cancels() {
    let host = host();
    let first = Transaction::lookup(&host, key("k")).execute().await.unwrap();
    let waiter = {
        let host = host.clone();
        tokio::spawn(async move { Transaction::lookup(&host, key("k")).execute().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    drop(first);
    assert!(waiter.await.unwrap().unwrap().must_insert());
}

#[tokio::test(start_paused = true)]
async fn close_cancels_and_closes() {
    let host = host();
    let first = Transaction::lookup(&host, key("k")).execute().await.unwrap();
    let waiter = {
        let host = host.clone();
        tokio::spawn(async move { Transaction::lookup(&host, key("k")).execute().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    first.close().unwrap();
    first.close().unwrap();
    assert!(matches!(
        first.cancel_insert_or_update(),
        Err(CacheError::InvalidOperation)
    ));
    assert!(waiter.await.unwrap().unwrap().must_insert());
}

#[tokio::test(start_paused = true)]
async fn producer_failure_is_shared_with_waiters() {
    let host = host();
    let first = Transaction::lookup(&host, key("k")).execute().await.unwrap();
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let host = host.clone();
            tokio::spawn(async move { Transaction::lookup(&host, key("k")).execute().await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(10)).await;
    first.fail_insert_or_update("origin unreachable").unwrap();

    for waiter in waiters {
        match waiter.await.unwrap() {
            Err(CacheError::ProducerFailed(reason)) => assert_eq!(&*reason, "origin unreachable"),
            other => panic!("expected a shared failure, got {:?}", other.map(|_| ())),
        }
    }

    // Later lookups start over.
    let retry = Transaction::lookup(&host, key("k")).execute().await.unwrap();
    assert!(retry.must_insert());
}

#[tokio::test(start_paused = true)]
async fn lookup_timeout_leaves_the_obligation_alone() {
    let host = host();
    let first = Transaction::lookup(&host, key("k")).execute().await.unwrap();
    let timed_out = Transaction::lookup(&host, key("k"))
        .timeout(Duration::from_millis(50))
        .execute()
        .await;
    assert!(matches!(timed_out, Err(CacheError::TimedOut)));
    assert!(first.must_insert());

    let mut writer = first.insert(TTL).execute().unwrap();
    writer.write_str("done").unwrap();
    writer.finish().unwrap();
    let tx = Transaction::lookup(&host, key("k"))
        .timeout(Duration::from_millis(50))
        .execute()
        .await
        .unwrap();
    assert!(tx.found().is_some());
}

#[tokio::test]
async fn initial_age_decides_freshness() {
    let host = host();
    let mut writer = core::insert(&host, key("usable"), Duration::from_secs(10))
        .initial_age(Duration::from_secs(15))
        .stale_while_revalidate(Duration::from_secs(30))
        .execute()
        .unwrap();
    writer.write_str("stale").unwrap();
    writer.finish().unwrap();

    let found = core::lookup(&host, key("usable")).execute().await.unwrap().unwrap();
    assert!(found.is_stale());
    assert!(found.is_usable());
    assert!(found.age() >= Duration::from_secs(15));

    // The first transaction revalidates; the next one is served the stale object meanwhile.
    let revalidating = Transaction::lookup(&host, key("usable")).execute().await.unwrap();
    assert!(revalidating.must_insert_or_update());
    assert!(!revalidating.must_insert());
    assert!(revalidating.found().unwrap().is_usable());
    let served = Transaction::lookup(&host, key("usable")).execute().await.unwrap();
    assert!(!served.must_insert_or_update());
    assert!(served.found().unwrap().is_stale());

    let mut writer = core::insert(&host, key("expired"), Duration::from_secs(10))
        .initial_age(Duration::from_secs(50))
        .stale_while_revalidate(Duration::from_secs(30))
        .execute()
        .unwrap();
    writer.write_str("expired").unwrap();
    writer.finish().unwrap();
    let found = core::lookup(&host, key("expired")).execute().await.unwrap().unwrap();
    assert!(found.is_stale());
    assert!(!found.is_usable());
}

#[tokio::test]
async fn update_replaces_all_metadata() {
    let host = host();
    let mut writer = core::insert(&host, key("k"), Duration::from_secs(10))
        .initial_age(Duration::from_secs(20))
        .surrogate_keys(["kept-only-if-repeated"])
        .user_metadata(Bytes::from_static(b"v1"))
        .execute()
        .unwrap();
    writer.write_str("body").unwrap();
    writer.finish().unwrap();

    let tx = Transaction::lookup(&host, key("k")).execute().await.unwrap();
    assert!(tx.must_insert_or_update());
    let stale = tx.found().unwrap();
    assert!(!stale.is_usable());
    tx.update(TTL).execute().unwrap();

    let found = core::lookup(&host, key("k")).execute().await.unwrap().unwrap();
    assert!(!found.is_stale());
    assert_eq!(found.ttl(), TTL);
    assert_eq!(found.surrogate_keys().count(), 0);
    assert!(found.user_metadata().is_empty());
    assert_eq!(found.to_stream().unwrap().into_string().await.unwrap(), "body");
}

#[tokio::test]
async fn update_needs_a_found_object() {
    let host = host();
    let tx = Transaction::lookup(&host, key("k")).execute().await.unwrap();
    assert!(tx.found().is_none());
    assert!(matches!(
        tx.update(TTL).execute(),
        Err(CacheError::InvalidOperation)
    ));
}

#[tokio::test]
async fn range_reads() {
    let host = host();
    insert_str(&host, "k", "my cached object").await;
    let found = core::lookup(&host, key("k")).execute().await.unwrap().unwrap();

    let body = found.to_stream_from_range(Some(3), None).unwrap();
    assert_eq!(body.into_string().await.unwrap(), "cached object");
    let body = found.to_stream_from_range(Some(3), Some(8)).unwrap();
    assert_eq!(body.into_string().await.unwrap(), "cached");
    // An end of zero reads to the end.
    let body = found.to_stream_from_range(Some(10), Some(0)).unwrap();
    assert_eq!(body.into_string().await.unwrap(), "object");
    // A start past the end reads everything.
    let body = found.to_stream_from_range(Some(100), None).unwrap();
    assert_eq!(body.into_string().await.unwrap(), "my cached object");

    assert!(matches!(
        found.to_stream_from_range(Some(3), Some(1)),
        Err(CacheError::InvalidArgument)
    ));
}

#[tokio::test]
async fn one_open_stream_per_found() {
    let host = host();
    insert_str(&host, "k", "my cached object").await;
    let found = core::lookup(&host, key("k")).execute().await.unwrap().unwrap();

    let open = found.to_stream().unwrap();
    assert!(matches!(
        found.to_stream(),
        Err(CacheError::InvalidOperation)
    ));
    drop(open);
    let reopened = found.to_stream().unwrap();
    assert_eq!(reopened.into_string().await.unwrap(), "my cached object");
}

#[tokio::test]
async fn closed_transactions_keep_open_streams() {
    let host = host();
    insert_str(&host, "k", "my cached object").await;
    let tx = Transaction::lookup(&host, key("k")).execute().await.unwrap();
    let found = tx.found().unwrap();
    let body = found.to_stream().unwrap();
    tx.close().unwrap();
    assert_eq!(body.into_string().await.unwrap(), "my cached object");
    assert!(matches!(
        found.to_stream(),
        Err(CacheError::InvalidOperation)
    ));
}

#[tokio::test]
async fn surrogate_key_purges() {
    let host = host();
    for name in ["a", "b"] {
        let mut writer = core::insert(&host, key(name), TTL)
            .surrogate_keys(["my_key"])
            .execute()
            .unwrap();
        writer.write_str(name).unwrap();
        writer.finish().unwrap();
    }
    insert_str(&host, "untagged", "kept").await;

    soft_purge_surrogate_key(&host, "my_key").unwrap();
    let found = core::lookup(&host, key("a")).execute().await.unwrap().unwrap();
    assert!(found.is_stale());
    let tx = Transaction::lookup(&host, key("a")).execute().await.unwrap();
    assert!(tx.must_insert_or_update());
    drop(tx);

    purge_surrogate_key(&host, "my_key").unwrap();
    for name in ["a", "b"] {
        assert!(core::lookup(&host, key(name)).execute().await.unwrap().is_none());
    }
    assert!(core::lookup(&host, key("untagged")).execute().await.unwrap().is_some());
}

#[tokio::test]
async fn oversized_metadata_is_rejected() {
    let host = host();
    let result = core::insert(&host, key("k"), TTL)
        .user_metadata(Bytes::from(vec![0u8; 64 * 1024 + 1]))
        .execute();
    assert!(matches!(result, Err(CacheError::LimitExceeded)));
}

#[tokio::test]
async fn oversized_keys_are_rejected() {
    let host = host();
    let key = Bytes::from(vec![b'k'; 4097]);
    assert!(matches!(
        core::lookup(&host, key).execute().await,
        Err(CacheError::LimitExceeded)
    ));
}
