// tests/unit_rate_limit_test.rs

use opalstore::core::cluster::rate_limit::RateLimiter;
use std::net::{IpAddr, Ipv4Addr};

fn ip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
}

#[test]
fn burst_is_honored_then_exhausted() {
    let limiter = RateLimiter::new(1, 5);
    for i in 0..5 {
        assert!(limiter.check(ip(1)), "request {i} should pass within burst");
    }
    assert!(!limiter.check(ip(1)), "burst exhausted");
}

#[test]
fn sources_are_limited_independently() {
    let limiter = RateLimiter::new(1, 2);
    assert!(limiter.check(ip(1)));
    assert!(limiter.check(ip(1)));
    assert!(!limiter.check(ip(1)));
    // A different source still has its full burst.
    assert!(limiter.check(ip(2)));
}

#[test]
fn tokens_refill_over_time() {
    let limiter = RateLimiter::new(1000, 2);
    assert!(limiter.check(ip(1)));
    assert!(limiter.check(ip(1)));
    assert!(!limiter.check(ip(1)));
    std::thread::sleep(std::time::Duration::from_millis(10));
    assert!(limiter.check(ip(1)), "bucket refilled at 1000/s");
}

#[test]
fn idle_sources_are_evicted() {
    let limiter = RateLimiter::new(1000, 2);
    limiter.check(ip(1));
    assert_eq!(limiter.tracked_sources(), 1);
    std::thread::sleep(std::time::Duration::from_millis(10));
    limiter.evict_idle();
    assert_eq!(limiter.tracked_sources(), 0);
}
