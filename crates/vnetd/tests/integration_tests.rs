//! End-to-end tests driving a full daemon against the simulated platform
//! with in-memory sinks.

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use vnetd::*;

// ============================================================================
// HELPERS
// ============================================================================

fn test_config() -> VnetdConfig {
    let mut config = VnetdConfig::default();
    config.publish.channel_depth = 1024;
    config.publish.hostname = Some("sw1".to_string());
    config.poll.interval_secs = 60.0;
    config.poll.fast_interval_ms = 1000.0;
    config.poll.unresolved_arp_interval_secs = 60.0;
    config.control.listen = "127.0.0.1:0".to_string();
    config.platform.ports = 1;
    config
}

struct Harness {
    daemon: Daemon,
    slow: Arc<Mutex<Vec<String>>>,
    fast: Arc<Mutex<Vec<String>>>,
}

async fn start(messages: Option<mpsc::Receiver<Message>>) -> Harness {
    let config = test_config();
    let slow = MemorySink::new();
    let fast = MemorySink::new();
    let (slow_lines, fast_lines) = (slow.lines(), fast.lines());
    let platform = SimulatedPlatform::new(config.platform.ports, config.platform.subports);
    let daemon = Daemon::start(
        &config,
        Box::new(platform),
        SinkChoice::Memory { slow, fast },
        messages,
    )
    .await
    .unwrap();
    Harness {
        daemon,
        slow: slow_lines,
        fast: fast_lines,
    }
}

/// Waits until some line satisfies `pred`, returning a snapshot.
async fn wait_for(lines: &Arc<Mutex<Vec<String>>>, pred: impl Fn(&str) -> bool) -> Vec<String> {
    for _ in 0..500 {
        {
            let snapshot = lines.lock();
            if snapshot.iter().any(|l| pred(l.as_str())) {
                return snapshot.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out; got {:?}", lines.lock());
}

// ============================================================================
// STARTUP
// ============================================================================

#[tokio::test]
async fn test_startup_records_precede_first_poll() {
    let h = start(None).await;
    let lines = wait_for(&h.slow, |l| l.starts_with("vnet.poll.stop.channel-length: ")).await;

    assert_eq!(
        lines[..8].to_vec(),
        vec![
            "vnet.xeth1.speed: auto",
            "vnet.xeth1.media: copper",
            "vnet.xeth1.fec: none",
            "vnet.poll.max-channel-depth: 1024",
            "vnet.pollInterval: 60",
            "vnet.pollInterval.msec: 1000",
            "vnet.hf-broker: ",
            "vnet.ready: true",
        ]
    );
    assert!(lines[8].starts_with("vnet.poll.start.time: "));
    assert!(lines[9].starts_with("vnet.poll.start.channel-length: "));

    h.daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_first_tick_seeds_zero_counters() {
    let h = start(None).await;
    let lines = wait_for(&h.slow, |l| l.starts_with("vnet.poll.stop.channel-length: ")).await;

    let counters: Vec<&String> = lines
        .iter()
        .skip_while(|l| !l.starts_with("vnet.poll.start.channel-length"))
        .skip(1)
        .take_while(|l| !l.starts_with("vnet.poll.stop"))
        .collect();
    assert_eq!(counters.len(), 9);
    assert!(counters.iter().all(|l| l.ends_with(": 0")));
    assert_eq!(counters[0], "vnet.xeth1.rx-bytes: 0");
    assert_eq!(counters[8], "vnet.xethbr1.tx-packets: 0");

    h.daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fast_lines_reach_their_own_sink() {
    let h = start(None).await;
    let lines = wait_for(&h.fast, |l| l.contains(",xeth1,")).await;

    let fields: Vec<&str> = lines[0].split(',').collect();
    assert_eq!(fields[0], "sw1");
    assert!(fields[1].parse::<i64>().unwrap() > 0);
    assert_eq!(fields[2], "xeth1");
    assert_eq!(fields[3..5].to_vec(), vec!["rx-bytes", "0"]);
    assert!(lines[0].ends_with(','));
    // nothing namespaced on the hf path
    assert!(!lines[0].starts_with("vnet."));

    h.daemon.shutdown().await.unwrap();
}

// ============================================================================
// MUTATION PROTOCOL
// ============================================================================

#[tokio::test]
async fn test_apply_echo_is_published() {
    let h = start(None).await;
    h.daemon.event().apply("pollInterval", "10").await.unwrap();
    wait_for(&h.slow, |l| l == "vnet.pollInterval: 10.000000").await;

    let vnet = h.daemon.shutdown().await.unwrap();
    assert_eq!(vnet.intervals().poll(), Duration::from_secs(10));
}

#[tokio::test]
async fn test_rejected_apply_publishes_nothing() {
    let h = start(None).await;
    let event = h.daemon.event().clone();

    let err = event.apply("pollInterval", "0.5").await.unwrap_err();
    assert!(matches!(err, SettingError::Validation { .. }));

    let err = event.apply("bogus", "x").await.unwrap_err();
    assert!(err.to_string().contains("unknown setting"));

    // a later echo proves earlier records would already be visible
    event.apply("pollInterval.msec", "500").await.unwrap();
    let lines = wait_for(&h.slow, |l| l == "vnet.pollInterval.msec: 500.000000").await;
    assert!(!lines.iter().any(|l| l.starts_with("vnet.pollInterval: ") && l != "vnet.pollInterval: 60"));
    assert!(!lines.iter().any(|l| l.contains("bogus")));

    let vnet = h.daemon.shutdown().await.unwrap();
    assert_eq!(vnet.intervals().poll, 60.0);
    assert_eq!(vnet.intervals().fast_poll(), Duration::from_millis(500));
}

#[tokio::test]
async fn test_oversized_interval_keeps_scheduler_alive() {
    let h = start(None).await;
    let event = h.daemon.event().clone();

    for value in ["1e300", "1e18", "inf"] {
        let err = event.apply("pollInterval", value).await.unwrap_err();
        assert!(matches!(err, SettingError::Validation { .. }), "{value}: {err}");
    }
    let err = event.apply("pollInterval.msec", "1e300").await.unwrap_err();
    assert!(matches!(err, SettingError::Validation { .. }));

    event.apply("pollInterval", "10").await.unwrap();
    wait_for(&h.slow, |l| l == "vnet.pollInterval: 10.000000").await;

    let vnet = h.daemon.shutdown().await.unwrap();
    assert_eq!(vnet.intervals().poll(), Duration::from_secs(10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_applies() {
    let h = start(None).await;
    let mut tasks = Vec::new();
    for secs in 101..=150 {
        let event = h.daemon.event().clone();
        tasks.push(tokio::spawn(async move {
            event
                .apply("unresolved-arpInterval", &secs.to_string())
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let echo = |l: &str| l.starts_with("vnet.unresolved-arpInterval: ");
    let mut lines = wait_for(&h.slow, echo).await;
    for _ in 0..100 {
        if lines.iter().filter(|l| echo(l.as_str())).count() == 50 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        lines = h.slow.lock().clone();
    }
    assert_eq!(lines.iter().filter(|l| echo(l.as_str())).count(), 50);
    let pool = h.daemon.event().pool();
    assert_eq!(pool.available(), pool.size());

    h.daemon.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_apply_after_shutdown_is_unavailable() {
    let h = start(None).await;
    let event = h.daemon.event().clone();
    h.daemon.shutdown().await.unwrap();
    assert_eq!(
        event.apply("pollInterval", "10").await,
        Err(SettingError::Unavailable)
    );
}

// ============================================================================
// MESSAGES
// ============================================================================

#[tokio::test]
async fn test_ready_waits_for_break() {
    let (tx, rx) = mpsc::channel(8);
    let h = start(Some(rx)).await;

    tx.send(Message::LinkState {
        ifname: "xeth1".to_string(),
        up: false,
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!h.slow.lock().iter().any(|l| l.contains("ready") || l.contains(".link")));

    tx.send(Message::Break).await.unwrap();
    tx.send(Message::LinkState {
        ifname: "xeth1".to_string(),
        up: true,
    })
    .await
    .unwrap();
    let lines = wait_for(&h.slow, |l| l == "vnet.xeth1.link: true").await;
    let ready = lines.iter().position(|l| l == "vnet.ready: true").unwrap();
    let link = lines.iter().position(|l| l == "vnet.xeth1.link: true").unwrap();
    assert!(ready < link);
    assert!(!lines.iter().any(|l| l == "vnet.xeth1.link: false"));

    h.daemon.shutdown().await.unwrap();
}

// ============================================================================
// CONTROL SURFACE
// ============================================================================

async fn http(addr: std::net::SocketAddr, request: String) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_control_put_and_metrics() {
    let h = start(None).await;
    let addr = h.daemon.control_addr();

    let body = "40g";
    let response = http(
        addr,
        format!(
            "PUT /vnet/vnet.xeth1.speed HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        ),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("\r\n\r\n1"), "{response}");
    wait_for(&h.slow, |l| l == "vnet.xeth1.speed: 40g").await;

    let response = http(
        addr,
        "PUT /vnet/xeth9.speed HTTP/1.1\r\nHost: localhost\r\nContent-Length: 3\r\nConnection: close\r\n\r\n10g"
            .to_string(),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");

    let response = http(
        addr,
        "GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n".to_string(),
    )
    .await;
    assert!(response.contains("vnetd_settings_applied_total 1"));
    assert!(response.contains("vnetd_settings_failed_total 1"));

    h.daemon.shutdown().await.unwrap();
}

// ============================================================================
// ORDERING
// ============================================================================

#[test]
fn test_interface_order() {
    let mut ids = vec![
        IfIdentifier::other("br0"),
        IfIdentifier::port(5, 1, "xeth5-2"),
        IfIdentifier::port(3, 0, "xeth3"),
        IfIdentifier::port(5, 0, "xeth5-1"),
        IfIdentifier::parse("xeth5-1.10"),
    ];
    ids.sort();
    let names: Vec<&str> = ids.iter().map(|i| i.name.as_str()).collect();
    // higher ports first, then subport, vlan and name; non-ports last
    assert_eq!(names, vec!["xeth5-1", "xeth5-1.10", "xeth5-2", "xeth3", "br0"]);
}
