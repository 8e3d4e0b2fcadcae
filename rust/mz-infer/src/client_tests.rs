use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::client::{ClientError, ClientOptions, InferenceClient};
use crate::codec::encode_message;
use crate::frame::{read_frame, write_frame};
use crate::protocol::{BatchRequest, EvaluationResult, MsgKind};
use crate::server;

const WAIT: Duration = Duration::from_secs(5);

/// Options whose scheduler never fires during a test: flushes only happen
/// out of band.
fn quiet_opts() -> ClientOptions {
    ClientOptions {
        flush_interval: Duration::from_secs(30),
        ..ClientOptions::default()
    }
}

/// Echo server: each sample's value is its first index (or -1 when empty).
/// Records every batch it receives.
fn recording_server() -> (String, Arc<Mutex<Vec<BatchRequest>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_h = Arc::clone(&seen);
    let addr = server::spawn("127.0.0.1:0", move |b: &BatchRequest| {
        seen_h.lock().unwrap().push(b.clone());
        Ok((0..b.len())
            .map(|i| {
                let first = b.sample(i).and_then(|s| s.first().copied()).unwrap_or(-1);
                EvaluationResult::value_only(first as f32)
            })
            .collect())
    })
    .unwrap();
    (addr.to_string(), seen)
}

#[test]
fn requests_within_one_interval_share_one_call() {
    let (addr, seen) = recording_server();
    let client = InferenceClient::connect(
        &addr,
        ClientOptions {
            flush_interval: Duration::from_millis(200),
            max_batch_size: 32,
            ..ClientOptions::default()
        },
    )
    .unwrap();

    let lengths = [3usize, 1, 4, 1, 5];
    let tickets: Vec<_> = lengths
        .iter()
        .enumerate()
        .map(|(i, &n)| {
            let indices: Vec<i64> = (0..n as i64).map(|k| (i as i64) * 10 + k).collect();
            client.submit(indices).unwrap()
        })
        .collect();

    for (i, t) in tickets.iter().enumerate() {
        let r = t.recv_timeout(WAIT).unwrap();
        assert_eq!(r.value, (i * 10) as f32);
    }

    let batches = seen.lock().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].indices.len(), 14);
    assert_eq!(batches[0].offsets, vec![0, 3, 4, 8, 9]);

    let stats = client.stats_snapshot();
    assert_eq!(stats.calls, 1);
    assert_eq!(stats.results, 5);
    assert_eq!(stats.latency.count, 1);
}

#[test]
fn full_queue_flushes_without_waiting_for_tick() {
    let (addr, seen) = recording_server();
    let client = InferenceClient::connect(
        &addr,
        ClientOptions {
            max_batch_size: 4,
            ..quiet_opts()
        },
    )
    .unwrap();

    let tickets: Vec<_> = (0..4).map(|i| client.submit(vec![i]).unwrap()).collect();
    for t in &tickets {
        t.recv_timeout(WAIT).unwrap();
    }
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(seen.lock().unwrap()[0].len(), 4);
}

#[test]
fn in_flight_calls_never_exceed_concurrency_limit() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
    let addr = server::spawn("127.0.0.1:0", move |b: &BatchRequest| {
        let now = a.fetch_add(1, Ordering::SeqCst) + 1;
        p.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        a.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![EvaluationResult::value_only(0.0); b.len()])
    })
    .unwrap();

    let client = InferenceClient::connect(
        &addr.to_string(),
        ClientOptions {
            max_batch_size: 1,
            max_concurrency: 2,
            flush_interval: Duration::from_millis(1),
            ..ClientOptions::default()
        },
    )
    .unwrap();

    let tickets: Vec<_> = (0..10).map(|i| client.submit(vec![i]).unwrap()).collect();
    for t in &tickets {
        t.recv_timeout(WAIT).unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    let stats = client.stats_snapshot();
    assert_eq!(stats.calls, 10);
    assert!(stats.max_inflight <= 2);
    assert_eq!(stats.inflight, 0);
}

#[test]
fn failed_batch_fails_only_its_own_promises() {
    let addr = server::spawn("127.0.0.1:0", |b: &BatchRequest| {
        if b.indices.contains(&999) {
            return Err("model exploded".to_string());
        }
        Ok(vec![EvaluationResult::value_only(0.5); b.len()])
    })
    .unwrap();
    let client = InferenceClient::connect(
        &addr.to_string(),
        ClientOptions {
            max_batch_size: 5,
            ..quiet_opts()
        },
    )
    .unwrap();

    let doomed: Vec<_> = (0..5)
        .map(|i| client.submit(vec![if i == 2 { 999 } else { i }]).unwrap())
        .collect();
    let healthy: Vec<_> = (0..5).map(|i| client.submit(vec![i]).unwrap()).collect();

    for t in &doomed {
        match t.recv_timeout(WAIT) {
            Err(ClientError::Server(msg)) => assert_eq!(msg, "model exploded"),
            other => panic!("expected server error, got {other:?}"),
        }
    }
    for t in &healthy {
        assert_eq!(t.recv_timeout(WAIT).unwrap().value, 0.5);
    }
}

#[test]
fn direct_mode_sends_one_request_per_call() {
    let (addr, seen) = recording_server();
    let client = InferenceClient::connect(
        &addr,
        ClientOptions {
            batching: false,
            ..quiet_opts()
        },
    )
    .unwrap();

    let tickets: Vec<_> = (0..6).map(|i| client.submit(vec![i, i + 1]).unwrap()).collect();
    for (i, t) in tickets.iter().enumerate() {
        assert_eq!(t.recv_timeout(WAIT).unwrap().value, i as f32);
    }
    let batches = seen.lock().unwrap();
    assert_eq!(batches.len(), 6);
    assert!(batches.iter().all(|b| b.len() == 1));
}

#[test]
fn failed_health_probe_prevents_construction() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut sock, _peer) = listener.accept().unwrap();
        let _probe = read_frame(&mut sock).unwrap();
        write_frame(&mut sock, &encode_message(MsgKind::Error, 0, None)).unwrap();
    });

    let err = InferenceClient::connect(&addr.to_string(), quiet_opts()).unwrap_err();
    assert!(matches!(err, ClientError::Health(_)), "got {err:?}");
    server.join().unwrap();
}

#[test]
fn silent_server_fails_health_probe_within_connect_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (sock, _peer) = listener.accept().unwrap();
        thread::sleep(Duration::from_millis(500));
        drop(sock);
    });

    let err = InferenceClient::connect(
        &addr.to_string(),
        ClientOptions {
            connect_timeout: Duration::from_millis(100),
            ..quiet_opts()
        },
    )
    .unwrap_err();
    assert!(matches!(err, ClientError::Health(_)), "got {err:?}");
    server.join().unwrap();
}

/// Poll until the client reports nothing in flight.
fn wait_until_idle(client: &InferenceClient) {
    let deadline = Instant::now() + WAIT;
    while client.stats_snapshot().inflight > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn timed_out_call_holds_its_permit_until_the_reply_lands() {
    let addr = server::spawn("127.0.0.1:0", |b: &BatchRequest| {
        thread::sleep(Duration::from_millis(400));
        Ok(vec![EvaluationResult::value_only(0.0); b.len()])
    })
    .unwrap();
    let client = InferenceClient::connect(
        &addr.to_string(),
        ClientOptions {
            max_batch_size: 1,
            flush_interval: Duration::from_millis(5),
            request_timeout: Duration::from_millis(50),
            ..ClientOptions::default()
        },
    )
    .unwrap();

    let t = client.submit(vec![1, 2, 3]).unwrap();
    assert!(matches!(t.recv_timeout(WAIT), Err(ClientError::Timeout)));
    let stats = client.stats_snapshot();
    assert!(stats.timeouts >= 1);
    assert_eq!(stats.inflight, 1);

    wait_until_idle(&client);
    assert_eq!(client.stats_snapshot().inflight, 0);
}

#[test]
fn timeouts_do_not_let_calls_pile_up_on_a_slow_server() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
    let addr = server::spawn("127.0.0.1:0", move |b: &BatchRequest| {
        let now = a.fetch_add(1, Ordering::SeqCst) + 1;
        p.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(300));
        a.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![EvaluationResult::value_only(0.0); b.len()])
    })
    .unwrap();
    let client = InferenceClient::connect(
        &addr.to_string(),
        ClientOptions {
            max_batch_size: 1,
            max_concurrency: 2,
            flush_interval: Duration::from_millis(5),
            request_timeout: Duration::from_millis(40),
            ..ClientOptions::default()
        },
    )
    .unwrap();

    let mut tickets = Vec::new();
    for i in 0..10 {
        tickets.push(client.submit(vec![i]).unwrap());
        thread::sleep(Duration::from_millis(25));
    }
    for t in &tickets {
        assert!(matches!(t.recv_timeout(WAIT), Err(ClientError::Timeout)));
    }
    wait_until_idle(&client);

    assert!(peak.load(Ordering::SeqCst) <= 2);
    let stats = client.stats_snapshot();
    assert!(stats.calls <= 4, "calls = {}", stats.calls);
    assert!(stats.max_inflight <= 2);
    assert_eq!(stats.inflight, 0);
}

#[test]
fn cancel_withdraws_a_queued_request() {
    let (addr, seen) = recording_server();
    let client = InferenceClient::connect(&addr, quiet_opts()).unwrap();

    let t = client.submit(vec![7]).unwrap();
    assert_eq!(client.stats_snapshot().queued, 1);
    assert!(t.cancel());
    assert_eq!(client.stats_snapshot().queued, 0);
    client.flush();
    assert!(seen.lock().unwrap().is_empty());
}

#[test]
fn full_queue_reports_backpressure() {
    let (addr, _seen) = recording_server();
    let client = InferenceClient::connect(
        &addr,
        ClientOptions {
            max_queue: 2,
            ..quiet_opts()
        },
    )
    .unwrap();

    let _a = client.submit(vec![1]).unwrap();
    let _b = client.submit(vec![2]).unwrap();
    assert!(matches!(
        client.submit(vec![3]),
        Err(ClientError::Backpressure(_))
    ));
}

#[test]
fn dropping_the_client_fails_queued_tickets() {
    let (addr, _seen) = recording_server();
    let client = InferenceClient::connect(&addr, quiet_opts()).unwrap();
    let t = client.submit(vec![1]).unwrap();
    drop(client);
    assert!(matches!(t.recv_timeout(WAIT), Err(ClientError::Disconnected)));
}
