//! End-to-end gateway flow: turn envelopes in, rendered replies out,
//! against a real registry, runtime pool, and event store on disk.

use std::sync::Arc;

use brewva_core::{
    AclMode, ChannelCoordinator, CoordinatorLimits, Gateway, GatewayConfig, Orchestrator,
    StubTaskRunner,
};
use brewva_events::EventStore;
use brewva_registry::AgentRegistry;
use brewva_runtime::{RuntimeConfig, RuntimeManager, RuntimePoolConfig, StubRuntimeFactory};
use brewva_schema::TurnEnvelope;
use tempfile::TempDir;

async fn gateway_in(tmp: &TempDir) -> Gateway {
    let registry = Arc::new(AgentRegistry::open(tmp.path()).await.unwrap());
    let runtimes = Arc::new(RuntimeManager::new(
        tmp.path(),
        RuntimeConfig::default(),
        RuntimePoolConfig::default(),
        Arc::new(StubRuntimeFactory),
    ));
    let events = Arc::new(EventStore::new(tmp.path().join(".brewva/events")));
    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        runtimes,
        events,
        Arc::new(StubTaskRunner),
    ));
    let coordinator = ChannelCoordinator::new(
        CoordinatorLimits {
            fanout_max_agents: 2,
            ..Default::default()
        },
        orchestrator.clone(),
    );
    Gateway::new(
        registry,
        orchestrator,
        coordinator,
        GatewayConfig {
            owners: vec!["42".into()],
            acl_mode: AclMode::Closed,
        },
    )
}

fn owner_turn(text: &str) -> TurnEnvelope {
    let mut turn = TurnEnvelope::user("telegram", "100", text);
    turn.meta.sender_id = Some(serde_json::json!(42));
    turn
}

#[tokio::test]
async fn unauthorized_turn_gets_no_reply() {
    let tmp = TempDir::new().unwrap();
    let gateway = gateway_in(&tmp).await;

    let mut turn = TurnEnvelope::user("telegram", "100", "/list");
    turn.meta.sender_id = Some(serde_json::json!(7));
    assert!(gateway.handle_turn(&turn).await.unwrap().is_none());
}

#[tokio::test]
async fn create_list_and_delete_agents() {
    let tmp = TempDir::new().unwrap();
    let gateway = gateway_in(&tmp).await;

    let reply = gateway
        .handle_turn(&owner_turn("/new-agent name=Jack model=openai/gpt-5.3-codex"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, "Created agent @jack");

    let reply = gateway
        .handle_turn(&owner_turn("/list"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, "@default\n@jack");

    let reply = gateway
        .handle_turn(&owner_turn("/delete-agent @jack"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, "Deleted agent @jack");

    let reply = gateway
        .handle_turn(&owner_turn("/list"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, "@default");
}

#[tokio::test]
async fn duplicate_create_reports_stable_error() {
    let tmp = TempDir::new().unwrap();
    let gateway = gateway_in(&tmp).await;

    gateway.handle_turn(&owner_turn("/new-agent jack")).await.unwrap();
    let reply = gateway
        .handle_turn(&owner_turn("/new-agent jack"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, "duplicate_agent_id:jack");
}

#[tokio::test]
async fn mention_routes_to_named_agent() {
    let tmp = TempDir::new().unwrap();
    let gateway = gateway_in(&tmp).await;

    gateway.handle_turn(&owner_turn("/new-agent jack")).await.unwrap();
    let reply = gateway
        .handle_turn(&owner_turn("@jack, fix this bug"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, "stub:jack:fix this bug");
}

#[tokio::test]
async fn plain_text_goes_to_focused_agent() {
    let tmp = TempDir::new().unwrap();
    let gateway = gateway_in(&tmp).await;

    gateway.handle_turn(&owner_turn("/new-agent rose")).await.unwrap();

    // Before focusing, plain text lands on default.
    let reply = gateway
        .handle_turn(&owner_turn("hello there"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, "stub:default:hello there");

    let reply = gateway
        .handle_turn(&owner_turn("/focus @rose"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, "Focused @rose");

    let reply = gateway
        .handle_turn(&owner_turn("hello again"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, "stub:rose:hello again");
}

#[tokio::test]
async fn run_fans_out_within_limit() {
    let tmp = TempDir::new().unwrap();
    let gateway = gateway_in(&tmp).await;

    gateway.handle_turn(&owner_turn("/new-agent jack")).await.unwrap();
    gateway.handle_turn(&owner_turn("/new-agent mike")).await.unwrap();

    let reply = gateway
        .handle_turn(&owner_turn("/run @jack,@mike ship it"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, "@jack: stub:jack:ship it\n@mike: stub:mike:ship it");
}

#[tokio::test]
async fn run_over_limit_reports_fanout_error() {
    let tmp = TempDir::new().unwrap();
    let gateway = gateway_in(&tmp).await;

    for name in ["jack", "mike", "rose"] {
        gateway
            .handle_turn(&owner_turn(&format!("/new-agent {name}")))
            .await
            .unwrap();
    }

    let reply = gateway
        .handle_turn(&owner_turn("/run @jack,@mike,@rose ship it"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, "fanout_limit_exceeded:2");
}

#[tokio::test]
async fn unknown_command_is_echoed_as_error() {
    let tmp = TempDir::new().unwrap();
    let gateway = gateway_in(&tmp).await;

    let reply = gateway
        .handle_turn(&owner_turn("/teleport moon"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, "unknown_command:teleport");
}
