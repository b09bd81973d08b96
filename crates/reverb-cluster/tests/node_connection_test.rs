mod support;

use std::time::Duration;

use support::{drain, wait_for, MockNode};

use reverb_cluster::backoff::BackoffConfig;
use reverb_cluster::events::ClusterEvent;
use reverb_cluster::node::ConnectionStatus;
use reverb_cluster::registry::{ClusterConfig, ClusterRegistry};

const WAIT: Duration = Duration::from_secs(5);

fn fast_config(max_attempts: u32) -> ClusterConfig {
    let mut config = ClusterConfig::new("user-1");
    config.backoff = BackoffConfig {
        base: Duration::from_millis(25),
        max: Duration::from_millis(200),
        max_attempts,
        jitter: 0.0,
    };
    config.rest_timeout = Duration::from_millis(800);
    config.health_check_timeout = Duration::from_millis(800);
    config
}

#[tokio::test]
async fn handshake_connects_and_identifies() {
    let mock = MockNode::start().await;
    let (registry, mut rx) = ClusterRegistry::new(fast_config(0));
    registry.add_node(mock.descriptor("alpha")).await.unwrap();

    let event = wait_for(&mut rx, WAIT, |e| {
        matches!(e, ClusterEvent::NodeConnected { .. })
    })
    .await;
    assert!(matches!(
        event,
        ClusterEvent::NodeConnected { resumed: false, .. }
    ));

    let node = registry.node("alpha").await.unwrap();
    assert_eq!(node.status().await, ConnectionStatus::Connected);
    assert!(node.session_id().await.unwrap().starts_with("session-"));

    let identifies = mock.identifies().await;
    assert_eq!(identifies.len(), 1);
    assert_eq!(identifies[0]["op"], "identify");
    assert_eq!(identifies[0]["authorization"], "mock-password");
    assert_eq!(identifies[0]["userId"], "user-1");
    assert!(identifies[0]["clientName"]
        .as_str()
        .unwrap()
        .starts_with("reverb/"));
    assert!(identifies[0].get("resumeKey").is_none());
}

#[tokio::test]
async fn resumption_is_armed_after_the_handshake() {
    let mock = MockNode::start().await;
    let (registry, mut rx) = ClusterRegistry::new(fast_config(0));

    let mut descriptor = mock.descriptor("alpha");
    descriptor.resume_key = Some("resume-abc".to_string());
    descriptor.resume_timeout = Duration::from_secs(30);
    registry.add_node(descriptor).await.unwrap();

    wait_for(&mut rx, WAIT, |e| {
        matches!(e, ClusterEvent::NodeConnected { .. })
    })
    .await;

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let armed = mock
            .stream_frames()
            .await
            .iter()
            .any(|f| f["op"] == "configure_resume" && f["key"] == "resume-abc");
        if armed {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "resumption was never armed"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn stats_snapshots_replace_wholesale() {
    let mock = MockNode::start().await;
    let (registry, mut rx) = ClusterRegistry::new(fast_config(0));
    registry.add_node(mock.descriptor("alpha")).await.unwrap();
    wait_for(&mut rx, WAIT, |e| {
        matches!(e, ClusterEvent::NodeConnected { .. })
    })
    .await;

    mock.push_frame(stats_frame(3, 0.25)).await;
    wait_for(&mut rx, WAIT, |e| matches!(e, ClusterEvent::NodeStats { .. })).await;

    let node = registry.node("alpha").await.unwrap();
    assert_eq!(node.stats().await.unwrap().players, 3);

    mock.push_frame(stats_frame(9, 0.75)).await;
    wait_for(&mut rx, WAIT, |e| matches!(e, ClusterEvent::NodeStats { .. })).await;

    let stats = node.stats().await.unwrap();
    assert_eq!(stats.players, 9);
    assert_eq!(stats.cpu.system_load, 0.75);
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_killing_the_stream() {
    let mock = MockNode::start().await;
    let (registry, mut rx) = ClusterRegistry::new(fast_config(0));
    registry.add_node(mock.descriptor("alpha")).await.unwrap();
    wait_for(&mut rx, WAIT, |e| {
        matches!(e, ClusterEvent::NodeConnected { .. })
    })
    .await;

    // Unknown op, then a stats payload with the wrong shape.
    mock.push_frame(serde_json::json!({"op": "karaoke", "level": 11}))
        .await;
    mock.push_frame(serde_json::json!({"op": "stats", "players": "several"}))
        .await;
    // A valid frame still gets through afterwards.
    mock.push_frame(stats_frame(2, 0.1)).await;

    wait_for(&mut rx, WAIT, |e| matches!(e, ClusterEvent::NodeStats { .. })).await;

    let node = registry.node("alpha").await.unwrap();
    assert_eq!(node.status().await, ConnectionStatus::Connected);
    assert_eq!(node.stats().await.unwrap().players, 2);

    let events = drain(&mut rx);
    assert!(!events
        .iter()
        .any(|e| matches!(e, ClusterEvent::NodeDisconnected { .. })));
}

#[tokio::test]
async fn reconnects_after_an_unexpected_close() {
    let mock = MockNode::start().await;
    let (registry, mut rx) = ClusterRegistry::new(fast_config(0));
    registry.add_node(mock.descriptor("alpha")).await.unwrap();
    wait_for(&mut rx, WAIT, |e| {
        matches!(e, ClusterEvent::NodeConnected { .. })
    })
    .await;

    mock.kill_connections().await;

    wait_for(&mut rx, WAIT, |e| {
        matches!(e, ClusterEvent::NodeDisconnected { .. })
    })
    .await;
    wait_for(&mut rx, WAIT, |e| {
        matches!(e, ClusterEvent::NodeReconnecting { attempt: 1, .. })
    })
    .await;
    wait_for(&mut rx, WAIT, |e| {
        matches!(e, ClusterEvent::NodeConnected { .. })
    })
    .await;

    assert_eq!(mock.identifies().await.len(), 2);
    let node = registry.node("alpha").await.unwrap();
    assert_eq!(node.status().await, ConnectionStatus::Connected);
}

#[tokio::test]
async fn non_resumed_reconnect_orphans_players_exactly_once() {
    let mock = MockNode::start().await;
    let (registry, mut rx) = ClusterRegistry::new(fast_config(0));
    registry.add_node(mock.descriptor("alpha")).await.unwrap();
    wait_for(&mut rx, WAIT, |e| {
        matches!(e, ClusterEvent::NodeConnected { .. })
    })
    .await;

    registry.create_player(7).await.unwrap();
    registry.create_player(8).await.unwrap();

    mock.kill_connections().await;
    wait_for(&mut rx, WAIT, |e| {
        matches!(e, ClusterEvent::NodeConnected { resumed: false, .. })
    })
    .await;

    let mut orphaned = Vec::new();
    for _ in 0..2 {
        match wait_for(&mut rx, WAIT, |e| {
            matches!(e, ClusterEvent::ReassignmentRequired { .. })
        })
        .await
        {
            ClusterEvent::ReassignmentRequired { guild_id, node } => {
                assert_eq!(node, "alpha");
                orphaned.push(guild_id);
            }
            _ => unreachable!(),
        }
    }
    orphaned.sort_unstable();
    assert_eq!(orphaned, vec![7, 8]);

    // No duplicates trailing behind.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let extra = drain(&mut rx);
    assert!(!extra
        .iter()
        .any(|e| matches!(e, ClusterEvent::ReassignmentRequired { .. })));

    assert_eq!(registry.player(7).await.unwrap().node(), None);
}

#[tokio::test]
async fn resumed_reconnect_keeps_players_assigned() {
    let mock = MockNode::start().await;
    mock.set_accept_resume(true);
    let (registry, mut rx) = ClusterRegistry::new(fast_config(0));

    let mut descriptor = mock.descriptor("alpha");
    descriptor.resume_key = Some("resume-abc".to_string());
    descriptor.resume_timeout = Duration::from_secs(30);
    registry.add_node(descriptor).await.unwrap();
    wait_for(&mut rx, WAIT, |e| {
        matches!(e, ClusterEvent::NodeConnected { .. })
    })
    .await;

    registry.create_player(7).await.unwrap();

    mock.kill_connections().await;
    wait_for(&mut rx, WAIT, |e| {
        matches!(e, ClusterEvent::NodeConnected { resumed: true, .. })
    })
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let events = drain(&mut rx);
    assert!(!events
        .iter()
        .any(|e| matches!(e, ClusterEvent::ReassignmentRequired { .. })));
    assert_eq!(registry.player(7).await.unwrap().node(), Some("alpha"));
}

#[tokio::test]
async fn exhausted_backoff_emits_exactly_one_node_lost() {
    let mock = MockNode::start().await;
    let (registry, mut rx) = ClusterRegistry::new(fast_config(3));
    registry.add_node(mock.descriptor("alpha")).await.unwrap();
    wait_for(&mut rx, WAIT, |e| {
        matches!(e, ClusterEvent::NodeConnected { .. })
    })
    .await;

    mock.set_accepting(false);
    mock.kill_connections().await;

    wait_for(&mut rx, WAIT, |e| matches!(e, ClusterEvent::NodeLost { .. })).await;

    let node = registry.node("alpha").await.unwrap();
    assert_eq!(node.status().await, ConnectionStatus::Closed);
    assert_eq!(node.session_id().await, None);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let events = drain(&mut rx);
    assert!(!events
        .iter()
        .any(|e| matches!(e, ClusterEvent::NodeLost { .. })),
        "NodeLost must fire exactly once"
    );
}

#[tokio::test]
async fn disconnect_preempts_a_pending_reconnect() {
    let mock = MockNode::start().await;
    let mut config = fast_config(0);
    // Long enough that only cancellation can explain a fast return.
    config.backoff.base = Duration::from_secs(30);
    config.backoff.max = Duration::from_secs(30);
    let (registry, mut rx) = ClusterRegistry::new(config);
    registry.add_node(mock.descriptor("alpha")).await.unwrap();
    wait_for(&mut rx, WAIT, |e| {
        matches!(e, ClusterEvent::NodeConnected { .. })
    })
    .await;

    mock.set_accepting(false);
    mock.kill_connections().await;
    wait_for(&mut rx, WAIT, |e| {
        matches!(e, ClusterEvent::NodeReconnecting { .. })
    })
    .await;

    let node = registry.node("alpha").await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), node.disconnect("operator request"))
        .await
        .expect("disconnect must preempt the reconnect sleep");
    assert_eq!(node.status().await, ConnectionStatus::Closed);
}

#[tokio::test]
async fn health_check_sees_a_live_node() {
    let mock = MockNode::start().await;
    let (registry, mut rx) = ClusterRegistry::new(fast_config(0));
    registry.add_node(mock.descriptor("alpha")).await.unwrap();
    wait_for(&mut rx, WAIT, |e| {
        matches!(e, ClusterEvent::NodeConnected { .. })
    })
    .await;

    let report = registry.health_check().await;
    assert_eq!(report.len(), 1);
    assert!(report[0].healthy);

    let probes: Vec<_> = mock
        .rest_requests()
        .await
        .into_iter()
        .filter(|r| r.path == "/v1/info")
        .collect();
    assert_eq!(probes.len(), 1);
}

fn stats_frame(players: u64, system_load: f64) -> serde_json::Value {
    serde_json::json!({
        "op": "stats",
        "players": players,
        "playingPlayers": players,
        "uptimeMs": 120_000,
        "memory": {"free": 512, "used": 512, "allocated": 1024, "reservable": 2048},
        "cpu": {"cores": 8, "systemLoad": system_load, "nodeLoad": system_load / 2.0},
        "frames": {"sent": 3000, "nulled": 0, "deficit": 0}
    })
}
