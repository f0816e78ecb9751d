use std::{sync::Arc, time::Duration};

use control_link_agent::{Agent, AgentError};
use control_link_core::{LinkConfig, ManualClock, OperationError, operation_fn};
use control_link_executor::RequireUrl;
use control_link_transport::{
    EncryptionKey, Frame, MemoryConnector, MessageCodec, RemoteEnd, close_code,
};
use serde_json::{Value, json};
use tokio::{sync::mpsc, time};

struct Harness {
    agent: Arc<Agent>,
    accepted: mpsc::UnboundedReceiver<RemoteEnd>,
}

fn harness(config: LinkConfig) -> Harness {
    let (connector, accepted) = MemoryConnector::new();
    let agent = Agent::builder(config, Arc::new(connector)).build();
    register_demo_operations(&agent);
    Harness {
        agent: Arc::new(agent),
        accepted,
    }
}

fn register_demo_operations(agent: &Agent) {
    agent.register("echo", operation_fn(|params| async move { Ok(params) }));
    agent.register(
        "fail",
        operation_fn(|_| async { Err(OperationError::new("element not found")) }),
    );
    agent.register_validated(
        "navigate",
        operation_fn(|params: Value| async move { Ok(json!({ "url": params["url"] })) }),
        RequireUrl::new("url"),
    );
}

/// Next non-heartbeat, non-status message from the agent.
async fn next_reply(remote: &mut RemoteEnd) -> Value {
    loop {
        let message = remote.recv_json().await.expect("agent closed the connection");
        match message["type"].as_str() {
            Some("heartbeat" | "status") => {}
            _ => return message,
        }
    }
}

async fn started(h: &mut Harness) -> RemoteEnd {
    h.agent.start().await.unwrap();
    let mut remote = h.accepted.recv().await.unwrap();
    let status = remote.recv_json().await.unwrap();
    assert_eq!(status["status"], "connected");
    remote
}

#[tokio::test]
async fn test_command_round_trip() {
    let mut h = harness(LinkConfig::default());
    let mut remote = started(&mut h).await;

    remote.send_json(&json!({
        "command_id": "cmd-1",
        "type": "echo",
        "params": { "text": "hi" },
        "timestamp": 1
    }));
    let reply = next_reply(&mut remote).await;
    assert_eq!(reply["command_id"], "cmd-1");
    assert_eq!(reply["success"], true);
    assert_eq!(reply["result"], json!({ "text": "hi" }));
    assert_eq!(reply["error"], Value::Null);

    assert_eq!(h.agent.history().len(), 1);
}

#[tokio::test]
async fn test_failures_are_reported_not_raised() {
    let mut h = harness(LinkConfig::default());
    let mut remote = started(&mut h).await;

    remote.send_json(&json!({ "command_id": "c1", "type": "teleport", "params": {} }));
    let reply = next_reply(&mut remote).await;
    assert_eq!(reply["success"], false);
    assert!(reply["error"].as_str().unwrap().contains("teleport"));

    remote.send_json(&json!({ "command_id": "c2", "type": "fail" }));
    let reply = next_reply(&mut remote).await;
    assert_eq!(reply["error"], "element not found");

    remote.send_json(&json!({
        "command_id": "c3",
        "type": "navigate",
        "params": { "url": "javascript:alert(1)" }
    }));
    let reply = next_reply(&mut remote).await;
    assert_eq!(reply["command_id"], "c3");
    assert_eq!(reply["success"], false);

    // Registered type without a command id: answered with a null id.
    remote.send_json(&json!({ "type": "echo", "params": {} }));
    let reply = next_reply(&mut remote).await;
    assert_eq!(reply["command_id"], Value::Null);
    assert_eq!(reply["success"], false);

    // Only the operation that actually ran is in the history.
    assert_eq!(h.agent.history().len(), 1);
}

#[tokio::test]
async fn test_queue_completion_is_delivered() {
    let mut h = harness(LinkConfig::default());
    let mut remote = started(&mut h).await;

    remote.send_json(&json!({
        "command_id": "q1",
        "type": "create_queue",
        "params": {
            "commands": [
                { "type": "echo", "params": { "n": 1 } },
                { "type": "fail" },
                { "type": "echo", "params": { "n": 3 } }
            ],
            "stop_on_error": true
        }
    }));

    let mut created = None;
    let mut completed = None;
    while created.is_none() || completed.is_none() {
        let message = next_reply(&mut remote).await;
        if message["type"] == "queue_completed" {
            completed = Some(message);
        } else {
            created = Some(message);
        }
    }
    let created = created.unwrap();
    let completed = completed.unwrap();

    assert_eq!(created["command_id"], "q1");
    assert_eq!(completed["queueId"], created["result"]["queueId"]);
    assert_eq!(completed["status"], "completed");
    assert_eq!(completed["summary"]["completed"], 1);
    assert_eq!(completed["summary"]["failed"], 1);
    assert_eq!(completed["summary"]["skipped"], 1);
}

#[tokio::test]
async fn test_authenticated_and_encrypted_session() {
    let config = LinkConfig {
        require_auth: true,
        require_encryption: true,
        auth_token: Some("token-1".to_string()),
        encryption_key: Some("shared-key".to_string()),
        ..LinkConfig::default()
    };
    let (connector, mut accepted) = MemoryConnector::new();
    let agent = Arc::new(Agent::builder(config, Arc::new(connector)).build());
    register_demo_operations(&agent);

    let starter = Arc::clone(&agent);
    let start = tokio::spawn(async move { starter.start().await });

    let mut remote = accepted.recv().await.unwrap();
    let auth = remote.recv_json().await.unwrap();
    assert_eq!(auth["type"], "auth");
    assert_eq!(auth["token"], "token-1");
    remote.send_json(&json!({ "type": "auth_response", "success": true }));
    start.await.unwrap().unwrap();

    let snapshot = agent.session().snapshot();
    assert!(snapshot.authenticated);
    assert!(snapshot.encryption_enabled);

    let codec = MessageCodec::from_key(Some(&EncryptionKey::new("shared-key")));
    let command = codec
        .encode(&json!({ "command_id": "e1", "type": "echo", "params": { "secret": true } }), true)
        .unwrap();
    remote.to_agent.send(Frame::Text(command)).unwrap();

    loop {
        let Some(Frame::Text(text)) = remote.recv_frame().await else {
            panic!("connection closed");
        };
        let decoded = codec.decode(&text).unwrap();
        if decoded.message["command_id"] == "e1" {
            assert_eq!(decoded.message["result"], json!({ "secret": true }));
            break;
        }
    }
}

#[tokio::test]
async fn test_start_twice_and_shutdown() {
    let mut h = harness(LinkConfig::default());
    let mut remote = started(&mut h).await;

    assert!(matches!(h.agent.start().await, Err(AgentError::AlreadyStarted)));

    h.agent.shutdown().await;
    let mut closed = false;
    while let Some(frame) = remote.recv_frame().await {
        if let Frame::Close { code, .. } = frame {
            assert_eq!(code, close_code::NORMAL);
            closed = true;
        }
    }
    assert!(closed);
    assert!(!h.agent.session().is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_sweep_prunes_old_tasks() {
    let clock = ManualClock::new(0);
    let (connector, mut accepted) = MemoryConnector::new();
    let agent = Agent::builder(LinkConfig::default(), Arc::new(connector))
        .clock(clock.clone())
        .build();
    register_demo_operations(&agent);
    agent.start().await.unwrap();

    let mut remote = accepted.recv().await.unwrap();
    remote.send_json(&json!({ "command_id": "old", "type": "echo" }));
    let reply = next_reply(&mut remote).await;
    assert_eq!(reply["command_id"], "old");
    assert_eq!(agent.history().len(), 1);

    clock.advance(Duration::from_secs(6 * 60));
    time::sleep(Duration::from_secs(61)).await;
    assert!(agent.history().is_empty());
}
