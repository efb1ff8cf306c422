use courier::client_spec::ClientGenerator;
use courier::queue::RequestQueue;
use courier::rate_limit::{Admission, RateLimitSpec, RateLimiter};
use courier::record::{RequestRecord, RequestStatus};
use courier::retry::RetryOptions;
use courier::{ClientSpec, Courier, CourierOptions, RequestConfig, TransportError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::sleep;

fn record(id: &str, priority: i32, retries: u32, timestamp: u64) -> RequestRecord {
    RequestRecord {
        request_id: id.to_string(),
        client_name: "test".to_string(),
        status: RequestStatus::InQueue,
        priority,
        cost: 1,
        timestamp,
        retries,
    }
}

#[test]
fn test_priority_discipline() {
    // If two requests are both in queue when admission selects one, the
    // better-ranked request goes first: priority, then retries, then
    // arrival time, then id.
    let mut queue = RequestQueue::new();
    queue.upsert(record("d-late", 1, 0, 400));
    queue.upsert(record("c-early", 1, 0, 100));
    queue.upsert(record("b-retrying", 1, 2, 300));
    queue.upsert(record("a-priority", 9, 0, 999));

    let mut admitted = Vec::new();
    while let Some(next) = queue.next_eligible() {
        admitted.push(next.request_id.clone());
        queue.remove(&next.request_id);
    }
    assert_eq!(admitted, vec!["a-priority", "b-retrying", "c-early", "d-late"]);
}

#[test]
fn test_deterministic_tiebreak_on_equal_rank() {
    // Equal priority, retries and timestamp: the smaller request id wins,
    // so two controllers sorting the same map agree on the admission.
    let mut queue_a = RequestQueue::new();
    let mut queue_b = RequestQueue::new();
    for id in ["mm", "aa", "zz"] {
        queue_a.upsert(record(id, 1, 0, 50));
    }
    for id in ["zz", "mm", "aa"] {
        queue_b.upsert(record(id, 1, 0, 50));
    }
    assert_eq!(queue_a.next_eligible().unwrap().request_id, "aa");
    assert_eq!(queue_b.next_eligible().unwrap().request_id, "aa");
}

#[tokio::test]
async fn test_concurrency_gate_scenario() {
    // S2: maxConcurrency 2. A (cost 1) and B (cost 1) start immediately;
    // C (cost 2) starts only after both have finished.
    let limiter = Arc::new(RateLimiter::new(RateLimitSpec::ConcurrencyLimit {
        max_concurrency: 2,
    }));

    assert_eq!(limiter.admit(1).await, Admission::Granted); // A
    assert_eq!(limiter.admit(1).await, Admission::Granted); // B

    let c = {
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move { limiter.admit(2).await })
    };

    sleep(Duration::from_millis(30)).await;
    assert!(!c.is_finished(), "C admitted before A and B finished");

    limiter.on_request_done(1).await; // A done
    sleep(Duration::from_millis(30)).await;
    assert!(!c.is_finished(), "C admitted before B finished");

    limiter.on_request_done(1).await; // B done
    assert_eq!(c.await.unwrap(), Admission::Granted);
}

#[tokio::test]
async fn test_token_bucket_invariant_under_ticks() {
    // Tokens never exceed maxTokens no matter how many refills land.
    let limiter = RateLimiter::new(RateLimitSpec::RequestLimit {
        interval: 10,
        tokens_to_add: 7,
        max_tokens: 10,
    });
    for _ in 0..50 {
        let balance = limiter.tick(false).await.unwrap();
        assert!(balance <= 10);
    }
    assert_eq!(limiter.tokens().await, Some(10));
}

#[test]
fn test_rate_limited_backoff_uses_bucket_interval() {
    // S3: requestLimit interval 100 → first retry waits 1 × 1 × 100 ms.
    let options = RetryOptions::default();
    let error = TransportError::from_status(429, None);

    let decision = options.evaluate(&error, 0);
    assert!(decision.should_retry);
    assert!(decision.is_rate_limited);
    assert_eq!(options.backoff_ms(1, Some(100)), 100);
    assert_eq!(options.backoff_ms(2, Some(100)), 400);
}

#[test]
fn test_retry_bound() {
    // A request is executed at most maxRetries + 1 times.
    let options = RetryOptions {
        max_retries: 3,
        ..Default::default()
    };
    let error = TransportError::from_status(503, None);

    let mut retries = 0u32;
    let mut executions = 1u32;
    while options.evaluate(&error, retries).should_retry {
        retries += 1;
        executions += 1;
    }
    assert_eq!(executions, 4);
}

#[test]
fn test_sub_client_inheritance_scenario() {
    // S5: "api:images" uses the parent's auth and concurrency slot, and
    // the child's baseURL.
    let mut parent = ClientSpec::new("api");
    parent.rate_limit = Some(RateLimitSpec::ConcurrencyLimit { max_concurrency: 5 });
    parent.authentication = Some(courier::AuthSpec::Token {
        token: "X".to_string(),
        encode_base64: false,
        header_name: None,
        prefix: None,
        exclude_prefix: false,
    });
    let mut sub = ClientSpec::new("images");
    sub.request_options.defaults.base_url = Some("https://img.example".to_string());
    parent.sub_clients = vec![sub];

    let flattened = parent.flatten();
    let images = flattened
        .iter()
        .find(|s| s.name == "api:images")
        .expect("flattened sub-client");

    assert_eq!(
        images.effective_rate_limit(),
        RateLimitSpec::SharedLimit {
            client_name: "api".to_string()
        }
    );
    assert!(images.authentication.is_some());

    let mut config = RequestConfig::get("api:images", "/thumbnails/1.png");
    images.request_options.defaults.apply_under(&mut config);
    assert_eq!(
        config.effective_url(),
        "https://img.example/thumbnails/1.png"
    );
}

// ----------------------------------------------------------------------
// Fleet scenarios against a live Redis. Run with:
//   cargo test -- --ignored
// with a Redis reachable at redis://localhost:6379.
// ----------------------------------------------------------------------

/// Minimal HTTP upstream: answers every request with 200 and a tiny body.
async fn spawn_upstream() -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                    .await;
            });
        }
    });
    addr
}

fn bucket_generator(interval: u64, tokens_to_add: u64, max_tokens: u64) -> ClientGenerator {
    Arc::new(move || {
        let mut spec = ClientSpec::new("test");
        spec.rate_limit = Some(RateLimitSpec::RequestLimit {
            interval,
            tokens_to_add,
            max_tokens,
        });
        vec![spec]
    })
}

fn fleet_options(prefix: &str, priority: i32, generator: ClientGenerator) -> CourierOptions {
    let mut options = CourierOptions::new("fleet-secret", "redis://localhost:6379")
        .with_key_prefix(prefix)
        .with_priority(priority);
    options.client_generators.insert("test".to_string(), generator);
    options
}

#[tokio::test]
#[ignore = "requires a Redis at localhost:6379"]
async fn test_token_bucket_across_two_instances() {
    // S1: the higher-priority instance controls; one admission per second;
    // five requests take at least four refill cycles.
    let prefix = format!("it-{}:", uuid::Uuid::new_v4());
    let upstream = spawn_upstream().await;

    let low = Courier::new(fleet_options(&prefix, 1, bucket_generator(1000, 1, 1)));
    let high = Courier::new(fleet_options(&prefix, 2, bucket_generator(1000, 1, 1)));
    low.start().await.unwrap();
    high.start().await.unwrap();

    // Let both instances see each other and settle the election.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(
        high.client_role("test").await.unwrap(),
        courier::ownership::Role::Controller
    );
    assert_eq!(
        low.client_role("test").await.unwrap(),
        courier::ownership::Role::Worker
    );

    let started = Instant::now();
    let mut submissions = Vec::new();
    for _ in 0..5 {
        let low = low.clone();
        let url = format!("http://{}/", upstream);
        submissions.push(tokio::spawn(async move {
            low.handle_request(RequestConfig::get("test", url)).await
        }));
    }
    for submission in submissions {
        submission.await.unwrap().unwrap();
    }
    assert!(
        started.elapsed() >= Duration::from_secs(4),
        "five cost-1 requests through a 1 token/s bucket finished in {:?}",
        started.elapsed()
    );

    low.stop().await.unwrap();
    high.stop().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a Redis at localhost:6379"]
async fn test_controller_failover() {
    // S4: when the top-priority instance dies, the next one takes over
    // within the heartbeat expiry and admission resumes.
    let prefix = format!("it-{}:", uuid::Uuid::new_v4());
    let upstream = spawn_upstream().await;

    let a = Courier::new(fleet_options(&prefix, 1, bucket_generator(500, 1, 1)));
    let b = Courier::new(fleet_options(&prefix, 2, bucket_generator(500, 1, 1)));
    let c = Courier::new(fleet_options(&prefix, 3, bucket_generator(500, 1, 1)));
    a.start().await.unwrap();
    b.start().await.unwrap();
    c.start().await.unwrap();
    sleep(Duration::from_millis(500)).await;

    assert_eq!(
        c.client_role("test").await.unwrap(),
        courier::ownership::Role::Controller
    );

    // Stop the controller; the survivors re-elect within the expiry window.
    c.stop().await.unwrap();

    sleep(Duration::from_secs(4)).await;
    assert_eq!(
        b.client_role("test").await.unwrap(),
        courier::ownership::Role::Controller
    );

    // The promoted controller still admits requests.
    let url = format!("http://{}/", upstream);
    let response = a
        .handle_request(RequestConfig::get("test", url))
        .await
        .unwrap();
    assert_eq!(response.status, 200);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a Redis at localhost:6379"]
async fn test_single_instance_round_trip() {
    // Smallest end-to-end pass: one instance, default client, one call.
    let prefix = format!("it-{}:", uuid::Uuid::new_v4());
    let upstream = spawn_upstream().await;

    let courier = Courier::new(
        CourierOptions::new("fleet-secret", "redis://localhost:6379").with_key_prefix(&prefix),
    );
    courier.start().await.unwrap();

    let url = format!("http://{}/", upstream);
    let response = courier
        .handle_request(RequestConfig::get("default", url))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "ok");

    courier.stop().await.unwrap();
}
