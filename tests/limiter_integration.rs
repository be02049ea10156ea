//! Integration tests for the token bucket rate limiter

use querygate::limiter::{RateLimitConfig, RateLimiter};
use std::sync::Arc;
use std::time::Duration;

fn limiter(rate_per_minute: u32, burst: u32) -> RateLimiter {
    RateLimiter::new(RateLimitConfig {
        rate_per_minute,
        burst,
        prune_after: None,
    })
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_default_burst_then_steady_rate() {
    let limiter = limiter(60, 10);
    let key = RateLimiter::key("alice", "execute_query");

    let admitted = (0..10).filter(|_| limiter.allow(&key)).count();
    assert_eq!(admitted, 10);
    assert!(!limiter.allow(&key));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(limiter.allow(&key));

    // A minute of steady traffic admits about rate_per_minute requests
    let mut steady = 0;
    for _ in 0..120 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if limiter.allow(&key) {
            steady += 1;
        }
    }
    assert!((59..=61).contains(&steady), "admitted {steady}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_bucket() {
    let limiter = Arc::new(limiter(1, 25));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let limiter = Arc::clone(&limiter);
        handles.push(tokio::spawn(async move {
            (0..10).filter(|_| limiter.allow("shared")).count()
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        admitted += handle.await.unwrap();
    }

    // Refill at one token per minute cannot add a whole token here
    assert_eq!(admitted, 25);
    let stats = limiter.stats();
    assert_eq!(stats.admitted, 25);
    assert_eq!(stats.denied, 55);
}

#[tokio::test(start_paused = true)]
async fn test_idle_buckets_pruned_on_traffic() {
    let limiter = RateLimiter::new(RateLimitConfig {
        rate_per_minute: 60,
        burst: 5,
        prune_after: Some(Duration::from_secs(30)),
    })
    .unwrap();

    for client in ["a", "b", "c"] {
        assert!(limiter.allow(&RateLimiter::key(client, "execute_query")));
    }
    assert_eq!(limiter.stats().tracked_keys, 3);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(limiter.allow(&RateLimiter::key("d", "execute_query")));
    assert_eq!(limiter.stats().tracked_keys, 1);
}

#[test]
fn test_unknown_key_reports_full_bucket() {
    let limiter = limiter(60, 7);
    assert!((limiter.remaining("nobody") - 7.0).abs() < 1e-9);
    assert_eq!(limiter.stats().tracked_keys, 0);
}
