// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use serial_test::serial;
use tokio_util::sync::CancellationToken;
use trackerd::geo::ratelimit::RateLimiter;

/// Ten consecutive acquires with 200 ms spacing take at least nine gaps
/// of wall-clock time, and not wildly more.
#[tokio::test]
#[serial]
async fn ten_acquires_observe_min_spacing() {
    let limiter = RateLimiter::new(Duration::from_millis(200));
    let cancel = CancellationToken::new();

    let started = std::time::Instant::now();
    for _ in 0..10 {
        limiter.acquire(&cancel).await.expect("acquire");
    }
    let elapsed = started.elapsed();

    assert!(
        elapsed >= Duration::from_millis(1800),
        "completed too fast: {elapsed:?}"
    );
    assert!(
        elapsed <= Duration::from_millis(2800),
        "scheduler jitter out of bounds: {elapsed:?}"
    );
}

/// Concurrent acquirers are served in order without collapsing the
/// spacing between any two of them.
#[tokio::test]
#[serial]
async fn concurrent_acquires_stay_spaced() {
    use std::sync::Arc;

    let limiter = Arc::new(RateLimiter::new(Duration::from_millis(50)));
    let cancel = CancellationToken::new();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let limiter = limiter.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            limiter.acquire(&cancel).await.expect("acquire");
            tokio::time::Instant::now()
        }));
    }

    let mut stamps = Vec::new();
    for h in handles {
        stamps.push(h.await.expect("join"));
    }
    stamps.sort();

    for pair in stamps.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= Duration::from_millis(45),
            "two acquires only {gap:?} apart"
        );
    }
}
