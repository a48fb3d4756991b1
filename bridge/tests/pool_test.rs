mod common;

use std::sync::Arc;

use common::{fast_config, mock_stdio, SpyConnector};
use serde_json::json;
use toolbridge_core::{
    CapabilityKind, ExecutionContextId, FailureKind, ServerId, StaticBudget, ToolAssignment,
    ToolBridge, UnlimitedBudget,
};

#[tokio::test]
async fn test_one_bridge_per_context_closed_on_run_end() {
    let service = ToolBridge::new(fast_config(), Arc::new(UnlimitedBudget)).unwrap();
    service
        .register_server(mock_stdio("alpha", "acme", &[]))
        .await
        .unwrap();
    service
        .register_server(mock_stdio("beta", "acme", &[]))
        .await
        .unwrap();

    let e1 = ExecutionContextId::new("E1");
    let alpha = ToolAssignment::new("agent", "alpha", CapabilityKind::Tool, "echo");
    let beta = ToolAssignment::new("agent", "beta", CapabilityKind::Tool, "echo");

    let a = service
        .invoke_assigned(&e1, &alpha, json!({"text": "a"}), None)
        .await
        .unwrap();
    let b = service
        .invoke_assigned(&e1, &beta, json!({"text": "b"}), None)
        .await
        .unwrap();
    assert_eq!(a.server_id.as_str(), "alpha");
    assert_eq!(b.server_id.as_str(), "beta");

    assert_eq!(service.pool().len(), 1);
    let bridge = service.pool().get(&e1).unwrap();
    assert_eq!(bridge.open_session_count(), 2);
    assert!(bridge.has_session(&ServerId::new("alpha")));
    assert!(bridge.has_session(&ServerId::new("beta")));

    assert!(service.run_ended(&e1).await);
    assert!(bridge.is_closed());
    assert_eq!(bridge.open_session_count(), 0);
    assert!(service.pool().is_empty());

    // Ending the run again is a no-op.
    assert!(!service.run_ended(&e1).await);
}

#[tokio::test]
async fn test_distinct_contexts_use_distinct_sessions() {
    let config = fast_config();
    let spy = SpyConnector::new(config.clone());
    let service =
        ToolBridge::with_connector(config, spy.clone(), Arc::new(UnlimitedBudget)).unwrap();
    service
        .register_server(mock_stdio("alpha", "acme", &[]))
        .await
        .unwrap();
    let baseline = spy.connects();

    let c1 = ExecutionContextId::new("C1");
    let c2 = ExecutionContextId::new("C2");
    for ctx in [&c1, &c2, &c1, &c2] {
        service.invoke(ctx, "echo", json!({}), None).await.unwrap();
    }

    assert_eq!(spy.connects(), baseline + 2);
    let b1 = service.pool().get(&c1).unwrap();
    let b2 = service.pool().get(&c2).unwrap();
    assert!(!Arc::ptr_eq(&b1, &b2));

    service.run_ended(&c1).await;
    assert!(b1.is_closed());
    assert!(!b2.is_closed());
    service
        .invoke(&c2, "echo", json!({}), None)
        .await
        .unwrap();
    assert_eq!(spy.connects(), baseline + 2);

    service.shutdown().await;
    assert!(b2.is_closed());
}

#[tokio::test]
async fn test_removed_server_sessions_closed() {
    let service = ToolBridge::new(fast_config(), Arc::new(UnlimitedBudget)).unwrap();
    service
        .register_server(mock_stdio("alpha", "acme", &[]))
        .await
        .unwrap();
    let ctx = ExecutionContextId::generate();
    service.invoke(&ctx, "echo", json!({}), None).await.unwrap();

    let bridge = service.pool().get(&ctx).unwrap();
    assert_eq!(bridge.open_session_count(), 1);

    service.remove_server(&ServerId::new("alpha")).await.unwrap();
    assert_eq!(bridge.open_session_count(), 0);

    let failure = service
        .invoke(&ctx, "echo", json!({}), None)
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::NotFound);
    service.run_ended(&ctx).await;
}

#[tokio::test]
async fn test_zero_budget_rejects_without_connecting() {
    let config = fast_config();
    let spy = SpyConnector::new(config.clone());
    let budget = StaticBudget::from_entries([("acme", 0.0)]);
    let service = ToolBridge::with_connector(config, spy.clone(), budget.into_provider()).unwrap();

    service
        .register_server(mock_stdio("alpha", "acme", &[]))
        .await
        .unwrap();
    let after_discovery = spy.connects();

    let ctx = ExecutionContextId::generate();
    let failure = service
        .invoke(&ctx, "echo", json!({"text": "hi"}), None)
        .await
        .unwrap_err();

    assert_eq!(failure.kind, FailureKind::BudgetExceeded);
    assert!(failure.aborts_run());
    assert_eq!(spy.connects(), after_discovery);
    assert!(!service.pool().contains(&ctx));
}

#[tokio::test]
async fn test_budget_is_per_owning_tenant() {
    let budget = StaticBudget::from_entries([("broke", 0.0), ("funded", 5.0)]);
    let service = ToolBridge::new(fast_config(), budget.into_provider()).unwrap();
    service
        .register_server(mock_stdio("funded-server", "funded", &[]))
        .await
        .unwrap();
    let ctx = ExecutionContextId::generate();

    let output = service
        .invoke(&ctx, "echo", json!({"ok": true}), None)
        .await
        .unwrap();
    assert_eq!(output.structured(), &json!({"ok": true}));
    service.run_ended(&ctx).await;
}

#[tokio::test]
async fn test_scoped_run_closes_sessions() {
    let service = ToolBridge::new(fast_config(), Arc::new(UnlimitedBudget)).unwrap();
    service
        .register_server(mock_stdio("alpha", "acme", &[]))
        .await
        .unwrap();
    let ctx = ExecutionContextId::generate();

    let bridge = service
        .scoped_run(ctx.clone(), async {
            service.invoke(&ctx, "echo", json!({}), None).await.unwrap();
            service.pool().get(&ctx).unwrap()
        })
        .await
        .unwrap();

    assert!(bridge.is_closed());
    assert!(!service.pool().contains(&ctx));
}

#[tokio::test]
async fn test_invoke_after_run_end_is_refused() {
    let config = fast_config();
    let spy = SpyConnector::new(config.clone());
    let service =
        ToolBridge::with_connector(config, spy.clone(), Arc::new(UnlimitedBudget)).unwrap();
    service
        .register_server(mock_stdio("alpha", "acme", &[]))
        .await
        .unwrap();
    let ctx = ExecutionContextId::new("finished");

    service.invoke(&ctx, "echo", json!({}), None).await.unwrap();
    assert!(service.run_ended(&ctx).await);
    let connects = spy.connects();

    let failure = service
        .invoke(&ctx, "echo", json!({}), None)
        .await
        .unwrap_err();
    assert_eq!(failure.kind, FailureKind::NotFound);
    assert_eq!(failure.server_id, Some(ServerId::new("alpha")));
    assert_eq!(spy.connects(), connects);
    assert!(service.pool().is_empty());
    assert!(service.pool().has_ended(&ctx));
    assert_eq!(service.health(&ServerId::new("alpha")).unwrap().consecutive_failures, 0);

    // Starting the run again reopens the context.
    let scope = service.begin_run(ctx.clone(), &[]);
    service.invoke(&ctx, "echo", json!({}), None).await.unwrap();
    scope.finish().await;
    assert!(service.pool().is_empty());
}
