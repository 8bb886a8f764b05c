//! Scenarios every driver must pass.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use tollgate::ratelimit::{
    AllowRequest, Driver, RateLimiter, ReserveRequest, Reservation, MAX_MICROS,
};

pub const SECOND: Duration = Duration::from_secs(1);
pub const MINUTE: Duration = Duration::from_secs(60);

/// A key no earlier run has touched.
pub fn unique_key(prefix: &str) -> String {
    format!(
        "{prefix}:{}",
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    )
}

/// Current time, whole seconds.
pub fn base_instant() -> DateTime<Utc> {
    DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap()
}

fn after(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    t + chrono::Duration::from_std(d).unwrap()
}

fn before(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    t - chrono::Duration::from_std(d).unwrap()
}

async fn reserve<D: Driver>(driver: &D, request: ReserveRequest) -> Reservation {
    let cancel = CancellationToken::new();
    assert_ok!(driver.reserve(&cancel, request).await)
}

/// Walk one key through admits, rejects and future reservations with an
/// explicit clock.
pub async fn reserve_with_now_advanced<D: Driver>(driver: &D, key: &str) {
    let burst = 10;
    let now = base_instant();
    let cancel = CancellationToken::new();

    let err = assert_err!(
        driver
            .reserve(&cancel, ReserveRequest::new("", SECOND, burst, 5).with_now(now))
            .await
    );
    assert!(err.is_invalid_parameters());

    // enough tokens
    let req = ReserveRequest::new(key, SECOND, burst, 5).with_now(now);
    let r = reserve(driver, req.clone()).await;
    assert!(r.is_ok());
    assert_eq!(r.request(), &req);
    assert_eq!(r.time_to_act(), before(now, 5 * SECOND));
    assert_eq!(r.now(), now);
    assert_eq!(r.delay_from(r.now()), Duration::ZERO);

    // insufficient tokens: 6 requested, 5 left
    let r = reserve(driver, ReserveRequest::new(key, SECOND, burst, 6).with_now(now)).await;
    assert!(!r.is_ok());
    assert_eq!(r.time_to_act(), after(now, SECOND));
    assert_eq!(r.retry_after_from(r.now()), SECOND);

    // enough tokens after waiting the advertised retry-after
    let now = after(now, SECOND);
    let r = reserve(driver, ReserveRequest::new(key, SECOND, burst, 6).with_now(now)).await;
    assert!(r.is_ok());
    assert_eq!(r.time_to_act(), now);
    assert_eq!(r.now(), now);

    // a horizon admits a reservation that is only valid later
    let r = reserve(
        driver,
        ReserveRequest::new(key, SECOND, burst, 3)
            .with_now(now)
            .with_max_future_reserve(3 * SECOND),
    )
    .await;
    assert!(r.is_ok());
    assert_eq!(r.time_to_act(), after(now, 3 * SECOND));
    assert_eq!(r.delay_from(r.now()), 3 * SECOND);

    // but not one beyond it
    let r = reserve(
        driver,
        ReserveRequest::new(key, SECOND, burst, 3)
            .with_now(now)
            .with_max_future_reserve(5 * SECOND),
    )
    .await;
    assert!(!r.is_ok());
    assert_eq!(r.time_to_act(), after(now, 6 * SECOND));
    assert_eq!(r.retry_after_from(r.now()), SECOND);

    // retrying after one second fits the horizon
    let now = after(now, SECOND);
    let r = reserve(
        driver,
        ReserveRequest::new(key, SECOND, burst, 3)
            .with_now(now)
            .with_max_future_reserve(5 * SECOND),
    )
    .await;
    assert!(r.is_ok());
    assert_eq!(r.time_to_act(), after(now, 5 * SECOND));
    assert_eq!(r.now(), now);
}

/// The boolean shortcut over the same sequence.
pub async fn allow_with_now_advanced<D: Driver>(limiter: &RateLimiter<D>, key: &str) {
    let burst = 10;
    let now = base_instant();
    let cancel = CancellationToken::new();

    let err = assert_err!(
        limiter
            .allow(&cancel, AllowRequest::new(key, SECOND, 0, 5).with_now(now))
            .await
    );
    assert!(err.is_invalid_parameters());

    let ok = assert_ok!(
        limiter
            .allow(&cancel, AllowRequest::new(key, SECOND, burst, 5).with_now(now))
            .await
    );
    assert!(ok);

    let ok = assert_ok!(
        limiter
            .allow(&cancel, AllowRequest::new(key, SECOND, burst, 6).with_now(now))
            .await
    );
    assert!(!ok);

    let ok = assert_ok!(
        limiter
            .allow(
                &cancel,
                AllowRequest::new(key, SECOND, burst, 6).with_now(after(now, SECOND))
            )
            .await
    );
    assert!(ok);
}

/// Burst of 5, one token per 10 minutes, one request per minute.
pub async fn burst_then_refill<D: Driver>(driver: &D, key: &str) {
    let per_token = 10 * MINUTE;
    let start = base_instant();

    let attempt = |offset: u32| {
        ReserveRequest::new(key, per_token, 5, 1).with_now(after(start, offset * MINUTE))
    };

    for offset in 0..5 {
        let r = reserve(driver, attempt(offset)).await;
        assert!(r.is_ok(), "offset {offset}m should be admitted");
    }
    for offset in 5..10 {
        let r = reserve(driver, attempt(offset)).await;
        assert!(!r.is_ok(), "offset {offset}m should be rejected");
        assert_eq!(r.retry_after_from(r.now()), (10 - offset) * MINUTE);
    }
    assert!(reserve(driver, attempt(10)).await.is_ok());
    let r = reserve(driver, attempt(11)).await;
    assert!(!r.is_ok());
    assert_eq!(r.retry_after_from(r.now()), 9 * MINUTE);

    // a long idle period refills the bucket to exactly its burst
    for offset in 200..205 {
        assert!(reserve(driver, attempt(offset)).await.is_ok());
    }
    assert!(!reserve(driver, attempt(205)).await.is_ok());
}

/// Requesting more tokens than the burst is never valid.
pub async fn tokens_above_burst_invalid<D: Driver>(driver: &D, key: &str) {
    let cancel = CancellationToken::new();
    for (burst, per_token) in [(1, SECOND), (5, MINUTE), (100, Duration::from_millis(3))] {
        let req = ReserveRequest::new(key, per_token, burst, burst + 1).with_now(base_instant());
        let err = assert_err!(driver.reserve(&cancel, req).await);
        assert!(err.is_invalid_parameters());
    }
}

/// A cancelled caller never reaches the store.
pub async fn cancelled_before_round_trip<D: Driver>(driver: &D, key: &str) {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let req = ReserveRequest::new(key, SECOND, 1, 1).with_now(base_instant());
    let err = assert_err!(driver.reserve(&cancel, req).await);
    assert!(err.is_cancelled());

    // the key is still fresh: a full burst fits
    let req = ReserveRequest::new(key, SECOND, 1, 1).with_now(base_instant());
    assert!(reserve(driver, req).await.is_ok());
}

/// Requests whose horizon lies past the supported range are invalid and
/// write nothing, whether `now` is explicit or read from the store.
pub async fn out_of_range_leaves_key_untouched<D: Driver>(driver: &D, key: &str) {
    let cancel = CancellationToken::new();
    let far_future = DateTime::from_timestamp_micros(MAX_MICROS + 1).unwrap();

    let req = ReserveRequest::new(key, SECOND, 3, 1).with_now(far_future);
    let err = assert_err!(driver.reserve(&cancel, req).await);
    assert!(err.is_invalid_parameters());

    let req = ReserveRequest::new(key, SECOND, 3, 1)
        .with_max_future_reserve(Duration::from_micros(MAX_MICROS as u64));
    let err = assert_err!(driver.reserve(&cancel, req).await);
    assert!(err.is_invalid_parameters());

    // the key is still fresh: the whole burst fits at once
    let now = base_instant();
    let r = reserve(driver, ReserveRequest::new(key, SECOND, 3, 3).with_now(now)).await;
    assert!(r.is_ok());
    assert_eq!(r.time_to_act(), now);
}

/// Two first-time reservations whose sum exceeds the burst: exactly one wins
/// and the loser's tokens are not recorded.
pub async fn concurrent_first_use<D: Driver + 'static>(driver: Arc<D>, key: &str) {
    let now = base_instant();
    let request = || ReserveRequest::new(key, SECOND, 10, 6).with_now(now);
    let cancel = CancellationToken::new();

    let (a, b) = tokio::join!(
        driver.reserve(&cancel, request()),
        driver.reserve(&cancel, request())
    );
    let admitted = [assert_ok!(a), assert_ok!(b)]
        .iter()
        .filter(|r| r.is_ok())
        .count();
    assert_eq!(admitted, 1);

    // 4 tokens remain, no more
    let r = reserve(&*driver, ReserveRequest::new(key, SECOND, 10, 4).with_now(now)).await;
    assert!(r.is_ok());
    assert_eq!(r.time_to_act(), now);
    let r = reserve(&*driver, ReserveRequest::new(key, SECOND, 10, 1).with_now(now)).await;
    assert!(!r.is_ok());
}

/// Many parallel single-token reservations admit exactly the burst.
pub async fn concurrent_burst<D: Driver + 'static>(driver: Arc<D>, key: &str) {
    let now = base_instant();
    let mut tasks = JoinSet::new();

    for _ in 0..25 {
        let driver = driver.clone();
        let key = key.to_string();
        tasks.spawn(async move {
            let cancel = CancellationToken::new();
            let req = ReserveRequest::new(key, SECOND, 10, 1).with_now(now);
            driver.reserve(&cancel, req).await
        });
    }

    let mut admitted = 0;
    while let Some(res) = tasks.join_next().await {
        let reservation = assert_ok!(assert_ok!(res));
        if reservation.is_ok() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);
}

/// Without an explicit `now` the driver reports the clock it used.
pub async fn reports_authoritative_now<D: Driver>(driver: &D, key: &str) {
    let before_call = Utc::now() - chrono::Duration::seconds(5);
    let r = reserve(driver, ReserveRequest::new(key, SECOND, 3, 1)).await;
    let after_call = Utc::now() + chrono::Duration::seconds(5);

    assert!(r.is_ok());
    assert!(r.now() > before_call && r.now() < after_call);
    assert_eq!(r.time_to_act(), before(r.now(), 2 * SECOND));
}
