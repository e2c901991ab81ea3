//! Integration tests for the dispatch path
//!
//! These tests drive the gateway and engine against in-memory nodes in
//! scenarios closer to a real deployment than the unit tests.

use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use switchyard_core::{
    Connection, ConnectionInfo, Error, Event, Result, Subsystem, Tenant, TransportErrorKind,
};
use switchyard_routing::{
    AuthProfile, Authorizer, ConnectionRegistry, DispatchEngine, Gateway, MethodSet, RoutingState,
    StaticPermissions, Strategy,
};

// Test node that can be configured to answer or to be unreachable
#[derive(Clone)]
struct TestNode {
    id: String,
    unreachable: Arc<AtomicBool>,
    call_count: Arc<AtomicUsize>,
}

impl TestNode {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            unreachable: Arc::new(AtomicBool::new(false)),
            call_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    fn get_call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connection for TestNode {
    async fn call(&self, method: &str, _args: &Value) -> Result<Value> {
        self.call_count.fetch_add(1, Ordering::SeqCst);

        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::transport(
                TransportErrorKind::Unreachable,
                format!("{} refused connection", self.id),
            ));
        }

        match method {
            "CoreSv1.Ping" => Ok(json!("Pong")),
            "CoreSv1.Status" => Ok(json!({ "node_id": self.id })),
            "StatSv1.GetQueueIDs" => Ok(json!([format!("{}-queue", self.id)])),
            other => Err(Error::business(format!("SERVER_ERROR: {} not served", other))),
        }
    }
}

fn tenant() -> Tenant {
    Tenant::new("cgrates.org").unwrap()
}

fn setup(nodes: &[&TestNode], strategy: Strategy) -> (Arc<ConnectionRegistry>, Gateway) {
    let registry = Arc::new(ConnectionRegistry::new());
    for node in nodes {
        for subsystem in [Subsystem::Core, Subsystem::Stats] {
            registry.register(
                &tenant(),
                subsystem,
                ConnectionInfo::new(node.id.clone()),
                Arc::new((*node).clone()),
            );
        }
    }
    let engine = DispatchEngine::new(registry.clone(), Arc::new(RoutingState::default()), tenant())
        .with_default_strategy(strategy);
    let gateway = Gateway::new(Arc::new(engine), Arc::new(Authorizer::disabled()));
    (registry, gateway)
}

#[tokio::test]
async fn test_ping_goes_to_first_node_only() {
    let a = TestNode::new("A");
    let b = TestNode::new("B");
    let (_registry, gateway) = setup(&[&a, &b], Strategy::Default);

    let reply = gateway
        .invoke("CoreSv1.Ping", Event::new("cgrates.org"), &Value::Null)
        .await
        .unwrap();

    assert_eq!(reply, json!("Pong"));
    assert_eq!(a.get_call_count(), 1);
    assert_eq!(b.get_call_count(), 0);
}

#[tokio::test]
async fn test_failover_to_second_node() {
    let a = TestNode::new("A");
    let b = TestNode::new("B");
    a.set_unreachable(true);
    let (registry, gateway) = setup(&[&a, &b], Strategy::Default);

    let reply = gateway
        .invoke("CoreSv1.Ping", Event::new("cgrates.org"), &Value::Null)
        .await
        .unwrap();

    assert_eq!(reply, json!("Pong"));
    assert_eq!(a.get_call_count(), 1);
    assert_eq!(b.get_call_count(), 1);

    let pool = registry.pool(&tenant(), Subsystem::Core).unwrap();
    assert!(!pool.get("A").unwrap().is_up());
    assert!(pool.get("B").unwrap().is_up());
    // Health is per pool; A's Stats membership was never exercised
    let stats = registry.pool(&tenant(), Subsystem::Stats).unwrap();
    assert!(stats.get("A").unwrap().is_up());
}

#[tokio::test]
async fn test_recovered_node_is_retried_when_all_down() {
    let a = TestNode::new("A");
    let b = TestNode::new("B");
    a.set_unreachable(true);
    b.set_unreachable(true);
    let (_registry, gateway) = setup(&[&a, &b], Strategy::Default);

    let err = gateway
        .invoke("CoreSv1.Ping", Event::new("cgrates.org"), &Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "NOT_FOUND");

    b.set_unreachable(false);
    let reply = gateway
        .invoke("CoreSv1.Ping", Event::new("cgrates.org"), &Value::Null)
        .await
        .unwrap();
    assert_eq!(reply, json!("Pong"));
    assert_eq!(a.get_call_count(), 2);
    assert_eq!(b.get_call_count(), 2);
}

#[tokio::test]
async fn test_business_error_passes_through() {
    let a = TestNode::new("A");
    let b = TestNode::new("B");
    let (_registry, gateway) = setup(&[&a, &b], Strategy::Default);

    let err = gateway
        .invoke("CoreSv1.Sleep", Event::new("cgrates.org"), &Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "SERVER_ERROR: CoreSv1.Sleep not served");
    assert_eq!(b.get_call_count(), 0);
}

#[tokio::test]
async fn test_broadcast_all_nodes_answer() {
    let a = TestNode::new("A");
    let b = TestNode::new("B");
    let (_registry, gateway) = setup(&[&a, &b], Strategy::Broadcast);

    let reply = gateway
        .invoke("CoreSv1.Status", Event::new("cgrates.org"), &Value::Null)
        .await
        .unwrap();

    assert_eq!(
        reply,
        json!({ "A": { "node_id": "A" }, "B": { "node_id": "B" } })
    );

    let queues = gateway
        .invoke("StatSv1.GetQueueIDs", Event::new("cgrates.org"), &Value::Null)
        .await
        .unwrap();
    assert_eq!(queues, json!(["A-queue", "B-queue"]));
}

#[tokio::test]
async fn test_broadcast_partial_failure() {
    let a = TestNode::new("A");
    let b = TestNode::new("B");
    b.set_unreachable(true);
    let (registry, gateway) = setup(&[&a, &b], Strategy::Broadcast);

    let err = gateway
        .invoke("CoreSv1.Ping", Event::new("cgrates.org"), &Value::Null)
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "PARTIALLY_EXECUTED");
    assert_eq!(err.partial_reply(), Some(&json!("Pong")));
    assert_eq!(a.get_call_count(), 1);
    assert_eq!(b.get_call_count(), 1);
    let pool = registry.pool(&tenant(), Subsystem::Core).unwrap();
    assert!(!pool.get("B").unwrap().is_up());
}

#[tokio::test]
async fn test_broadcast_all_unreachable() {
    let a = TestNode::new("A");
    let b = TestNode::new("B");
    a.set_unreachable(true);
    b.set_unreachable(true);
    let (_registry, gateway) = setup(&[&a, &b], Strategy::Broadcast);

    let err = gateway
        .invoke("CoreSv1.Ping", Event::new("cgrates.org"), &Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err, Error::NotFound);
}

#[tokio::test]
async fn test_round_robin_distribution() {
    let nodes: Vec<TestNode> = ["A", "B", "C"].iter().map(|id| TestNode::new(id)).collect();
    let refs: Vec<&TestNode> = nodes.iter().collect();
    let (_registry, gateway) = setup(&refs, Strategy::RoundRobin);

    for _ in 0..10 {
        gateway
            .invoke("CoreSv1.Ping", Event::new("cgrates.org"), &Value::Null)
            .await
            .unwrap();
    }

    let counts: Vec<usize> = nodes.iter().map(TestNode::get_call_count).collect();
    assert_eq!(counts, vec![4, 3, 3]);
}

#[tokio::test]
async fn test_round_robin_concurrent_calls() {
    let nodes: Vec<TestNode> = ["A", "B"].iter().map(|id| TestNode::new(id)).collect();
    let refs: Vec<&TestNode> = nodes.iter().collect();
    let (_registry, gateway) = setup(&refs, Strategy::RoundRobin);
    let gateway = Arc::new(gateway);

    let mut handles = vec![];
    for _ in 0..20 {
        let gateway = gateway.clone();
        handles.push(tokio::spawn(async move {
            gateway
                .invoke("CoreSv1.Ping", Event::new("cgrates.org"), &Value::Null)
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(nodes[0].get_call_count(), 10);
    assert_eq!(nodes[1].get_call_count(), 10);
}

#[tokio::test]
async fn test_sticky_route_id() {
    let nodes: Vec<TestNode> = ["A", "B", "C"].iter().map(|id| TestNode::new(id)).collect();
    let refs: Vec<&TestNode> = nodes.iter().collect();
    let (_registry, gateway) = setup(&refs, Strategy::RoundRobin);

    for _ in 0..6 {
        let event = Event::new("cgrates.org").with_route_id("session-42");
        gateway.invoke("CoreSv1.Ping", event, &Value::Null).await.unwrap();
    }

    let counts: HashMap<&str, usize> = nodes
        .iter()
        .map(|n| (n.id.as_str(), n.get_call_count()))
        .collect();
    assert_eq!(counts.values().filter(|&&c| c == 6).count(), 1);
    assert_eq!(counts.values().sum::<usize>(), 6);
}

#[tokio::test]
async fn test_sticky_route_moves_after_failover() {
    let a = TestNode::new("A");
    let b = TestNode::new("B");
    let (_registry, gateway) = setup(&[&a, &b], Strategy::Default);

    let event = || Event::new("cgrates.org").with_route_id("session-1");
    gateway.invoke("CoreSv1.Ping", event(), &Value::Null).await.unwrap();
    assert_eq!(a.get_call_count(), 1);

    a.set_unreachable(true);
    gateway.invoke("CoreSv1.Ping", event(), &Value::Null).await.unwrap();

    // A is back, but the route stays on B while B is healthy
    a.set_unreachable(false);
    gateway.invoke("CoreSv1.Ping", event(), &Value::Null).await.unwrap();
    assert_eq!(a.get_call_count(), 2);
    assert_eq!(b.get_call_count(), 2);
}

#[tokio::test]
async fn test_empty_pool_for_every_strategy() {
    for strategy in [
        Strategy::Default,
        Strategy::Random,
        Strategy::RoundRobin,
        Strategy::Broadcast,
        Strategy::Internal,
    ] {
        let (_registry, gateway) = setup(&[], strategy);
        let err = gateway
            .invoke("CoreSv1.Ping", Event::new("cgrates.org"), &Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err, Error::NotFound, "strategy {}", strategy);
    }
}

#[tokio::test]
async fn test_deregistered_pool_is_not_found() {
    let a = TestNode::new("A");
    let (registry, gateway) = setup(&[&a], Strategy::Default);

    assert!(registry.deregister(&tenant(), Subsystem::Core, "A"));
    let err = gateway
        .invoke("CoreSv1.Ping", Event::new("cgrates.org"), &Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err, Error::NotFound);
}

#[tokio::test]
async fn test_api_key_permitted_only_for_ping() {
    let a = TestNode::new("A");
    let registry = Arc::new(ConnectionRegistry::new());
    registry.register(&tenant(), Subsystem::Core, ConnectionInfo::new("A"), Arc::new(a.clone()));
    registry.register(&tenant(), Subsystem::Stats, ConnectionInfo::new("A"), Arc::new(a.clone()));

    let permissions = StaticPermissions::new(vec![AuthProfile::new(
        tenant(),
        "X",
        MethodSet::parse("CoreSv1.Ping"),
    )]);
    let authorizer = Authorizer::new(Arc::new(permissions), Duration::from_secs(60));
    let engine = DispatchEngine::new(registry, Arc::new(RoutingState::default()), tenant());
    let gateway = Gateway::new(Arc::new(engine), Arc::new(authorizer));

    let event = Event::new("cgrates.org").with_api_key("X");
    let err = gateway
        .invoke("StatSv1.ProcessEvent", event.clone(), &Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "UNAUTHORIZED_API");
    assert_eq!(a.get_call_count(), 0);

    let reply = gateway.invoke("CoreSv1.Ping", event, &Value::Null).await.unwrap();
    assert_eq!(reply, json!("Pong"));
    assert_eq!(a.get_call_count(), 1);
}

// Holds every call open until released
struct GatedNode {
    release: Arc<tokio::sync::Notify>,
}

#[async_trait::async_trait]
impl Connection for GatedNode {
    async fn call(&self, _method: &str, _args: &Value) -> Result<Value> {
        self.release.notified().await;
        Ok(json!("gated"))
    }
}

#[tokio::test]
async fn test_ratio_sends_calls_to_least_loaded_node() {
    let release = Arc::new(tokio::sync::Notify::new());
    let b = TestNode::new("B");
    let registry = Arc::new(ConnectionRegistry::new());
    registry.register(
        &tenant(),
        Subsystem::Core,
        ConnectionInfo::new("A").with_weight(20).with_ratio(1),
        Arc::new(GatedNode { release: release.clone() }),
    );
    registry.register(
        &tenant(),
        Subsystem::Core,
        ConnectionInfo::new("B").with_ratio(1),
        Arc::new(b.clone()),
    );
    let engine = Arc::new(DispatchEngine::new(
        registry.clone(),
        Arc::new(RoutingState::default()),
        tenant(),
    ));

    let held = tokio::spawn({
        let engine = engine.clone();
        async move {
            engine
                .dispatch(&Event::new("cgrates.org"), Subsystem::Core, None, "CoreSv1.Ping", &Value::Null)
                .await
        }
    });

    let node_a = registry.pool(&tenant(), Subsystem::Core).unwrap().get("A").cloned().unwrap();
    for _ in 0..50 {
        if node_a.in_flight() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(node_a.in_flight(), 1);

    let reply = engine
        .dispatch(&Event::new("cgrates.org"), Subsystem::Core, None, "CoreSv1.Ping", &Value::Null)
        .await
        .unwrap();
    assert_eq!(reply, json!("Pong"));
    assert_eq!(b.get_call_count(), 1);

    release.notify_one();
    assert_eq!(held.await.unwrap().unwrap(), json!("gated"));
    assert_eq!(node_a.in_flight(), 0);
}
