//! Integration tests for ServiceBinding reconciliation
//!
//! Bindings are driven against a ready instance; credentials land in the
//! in-memory secret store.

mod common;

use common::*;
use service_catalog_controller::broker::{BindResponse, LastOperationState};
use service_catalog_controller::config::ControllerConfig;
use service_catalog_controller::controller::reconciler::{ReconcileAction, RequeueReason};
use service_catalog_controller::crd::{
    AddKeyTransform, AddKeysFromTransform, BindingOperation, ObjectReference, RemoveKeyTransform,
    RenameKeyTransform, SecretTransform, UnbindStatus,
};
use service_catalog_controller::store::ResourceStore;
use std::time::Duration;

fn is_retry(action: ReconcileAction) -> bool {
    matches!(
        action,
        ReconcileAction::Requeue {
            reason: RequeueReason::Retry,
            ..
        }
    )
}

fn is_poll(action: ReconcileAction) -> bool {
    matches!(
        action,
        ReconcileAction::Requeue {
            reason: RequeueReason::Poll,
            ..
        }
    )
}

fn secret_value(h: &Harness, secret: &str, key: &str) -> Option<String> {
    h.secrets
        .data(NAMESPACE, secret)
        .and_then(|data| data.get(key).cloned())
        .map(|bytes| String::from_utf8(bytes).unwrap())
}

#[tokio::test]
async fn test_bind_writes_credentials_secret() {
    let h = Harness::new();
    let instance = h.ready_instance("db", "small").await;
    let created = h.bindings.create(binding("creds", "db")).unwrap();

    assert_eq!(h.reconcile_binding("creds").await, ReconcileAction::Done);

    let status = h.binding_status("creds");
    assert!(status.condition_is_true("Ready"));
    assert_eq!(reason(&status, "Ready").as_deref(), Some("InjectedBindResult"));
    assert_eq!(status.unbind_status, Some(UnbindStatus::Required));
    assert_eq!(status.reconciled_generation, Some(1));
    assert!(status.current_operation.is_none());

    assert_eq!(secret_value(&h, "creds", "username").as_deref(), Some("admin"));
    assert_eq!(secret_value(&h, "creds", "password").as_deref(), Some("s3cret"));
    assert_eq!(secret_value(&h, "creds", "port").as_deref(), Some("5432"));
    let owner = h.secrets.owner(NAMESPACE, "creds").unwrap();
    assert_eq!(owner.kind, "ServiceBinding");
    assert_eq!(owner.controller, Some(true));
    assert_eq!(Some(owner.uid), created.metadata.uid.clone());

    let binds = h.broker.binds.lock().unwrap().clone();
    assert_eq!(binds.len(), 1);
    assert_eq!(Some(binds[0].instance_id.clone()), instance.metadata.uid);
    assert_eq!(Some(binds[0].binding_id.clone()), created.metadata.uid);
    assert_eq!(binds[0].service_id, "svc-db");
    assert_eq!(binds[0].plan_id, "plan-small");
}

#[tokio::test]
async fn test_secret_name_and_transforms_apply() {
    let h = Harness::new();
    h.ready_instance("db", "small").await;
    let mut shaped = binding("creds", "db");
    shaped.spec.secret_name = Some("db-secret".to_string());
    shaped.spec.secret_transforms = vec![
        SecretTransform::RenameKey(RenameKeyTransform {
            from: "username".to_string(),
            to: "user".to_string(),
        }),
        SecretTransform::RemoveKey(RemoveKeyTransform {
            key: "port".to_string(),
        }),
        SecretTransform::AddKey(AddKeyTransform {
            key: "sslmode".to_string(),
            string_value: Some("require".to_string()),
            ..AddKeyTransform::default()
        }),
    ];
    h.bindings.create(shaped).unwrap();

    assert_eq!(h.reconcile_binding("creds").await, ReconcileAction::Done);

    let data = h.secrets.data(NAMESPACE, "db-secret").unwrap();
    let keys: Vec<&str> = data.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["password", "sslmode", "user"]);
    assert_eq!(secret_value(&h, "db-secret", "user").as_deref(), Some("admin"));
    assert!(h.secrets.data(NAMESPACE, "creds").is_none());
}

#[tokio::test]
async fn test_binding_waits_for_its_instance() {
    let h = Harness::new();
    h.bindings.create(binding("creds", "db")).unwrap();

    assert_eq!(h.reconcile_binding("creds").await, ReconcileAction::Done);
    assert_eq!(
        reason(&h.binding_status("creds"), "Ready").as_deref(),
        Some("ErrorNonexistentServiceInstance")
    );

    // Exists but was never provisioned
    h.instances.create(instance("db", "small")).unwrap();
    assert_eq!(h.reconcile_binding("creds").await, ReconcileAction::Done);
    let status = h.binding_status("creds");
    assert_eq!(reason(&status, "Ready").as_deref(), Some("ErrorInstanceNotReady"));
    assert!(status.current_operation.is_none());
    assert_eq!(h.broker.count(Call::Bind), 0);

    assert_eq!(h.settle_instance("db").await, ReconcileAction::Done);
    assert_eq!(h.reconcile_binding("creds").await, ReconcileAction::Done);
    assert!(h.binding_status("creds").condition_is_true("Ready"));
}

#[tokio::test]
async fn test_server_error_on_bind_unbinds_then_retries() {
    let h = Harness::new();
    h.ready_instance("db", "small").await;
    h.broker.script_binding(Call::Bind, Err(http_error(500)));
    h.bindings.create(binding("creds", "db")).unwrap();

    assert_eq!(h.reconcile_binding("creds").await, ReconcileAction::RequeueNow);
    let status = h.binding_status("creds");
    assert!(status.orphan_mitigation_in_progress);
    assert!(status.retry_after_orphan_mitigation);
    assert_eq!(reason(&status, "Ready").as_deref(), Some("BindCallFailed"));
    assert!(h.secrets.data(NAMESPACE, "creds").is_none());

    assert!(is_retry(h.reconcile_binding("creds").await));
    let status = h.binding_status("creds");
    assert!(!status.orphan_mitigation_in_progress);
    assert_eq!(
        reason(&status, "OrphanMitigation").as_deref(),
        Some("OrphanMitigationSuccessful")
    );

    assert_eq!(h.reconcile_binding("creds").await, ReconcileAction::Done);
    assert!(h.binding_status("creds").condition_is_true("Ready"));
    assert_eq!(
        h.broker.operations(),
        vec![Call::Provision, Call::Bind, Call::Unbind, Call::Bind]
    );
}

#[tokio::test]
async fn test_client_error_on_bind_fails_after_cleanup() {
    let h = Harness::new();
    h.ready_instance("db", "small").await;
    h.broker.script_binding(Call::Bind, Err(http_error(400)));
    h.bindings.create(binding("creds", "db")).unwrap();

    assert_eq!(h.settle_binding("creds").await, ReconcileAction::Done);
    let status = h.binding_status("creds");
    assert!(status.condition_is_true("Failed"));
    assert_eq!(reason(&status, "Failed").as_deref(), Some("BindCallFailed"));

    assert_eq!(h.reconcile_binding("creds").await, ReconcileAction::Done);
    assert_eq!(h.broker.count(Call::Bind), 1);
    assert_eq!(h.broker.count(Call::Unbind), 1);
}

#[tokio::test]
async fn test_asynchronous_bind_fetches_credentials() {
    let h = Harness::new();
    h.ready_instance("db", "small").await;
    h.broker.script_binding(
        Call::Bind,
        Ok(BindResponse {
            is_async: true,
            operation: Some("bind-1".to_string()),
            credentials: None,
        }),
    );
    h.broker.script_poll(
        Call::PollBinding,
        Ok(last_operation(LastOperationState::InProgress)),
    );
    h.broker.script_poll(
        Call::PollBinding,
        Ok(last_operation(LastOperationState::Succeeded)),
    );
    let created = h.bindings.create(binding("creds", "db")).unwrap();

    assert!(is_poll(h.reconcile_binding("creds").await));
    let status = h.binding_status("creds");
    assert!(status.async_op_in_progress);
    assert_eq!(status.current_operation, Some(BindingOperation::Bind));
    assert_eq!(status.last_operation.as_deref(), Some("bind-1"));

    assert!(is_poll(h.reconcile_binding("creds").await));
    assert!(h.secrets.data(NAMESPACE, "creds").is_none());

    assert_eq!(h.reconcile_binding("creds").await, ReconcileAction::Done);
    let status = h.binding_status("creds");
    assert!(status.condition_is_true("Ready"));
    assert!(!status.async_op_in_progress);
    assert_eq!(secret_value(&h, "creds", "password").as_deref(), Some("s3cret"));

    let polls = h.broker.polls.lock().unwrap().clone();
    assert_eq!(polls.len(), 2);
    assert!(polls.iter().all(|p| p.binding_id == created.metadata.uid));
    assert!(polls.iter().all(|p| p.operation.as_deref() == Some("bind-1")));
    assert_eq!(h.broker.count(Call::GetBinding), 1);
}

#[tokio::test]
async fn test_non_bindable_plan_fails_without_calling_the_broker() {
    let h = Harness::new();
    h.ready_instance("db", "archive").await;
    h.bindings.create(binding("creds", "db")).unwrap();

    assert_eq!(h.reconcile_binding("creds").await, ReconcileAction::Done);
    let status = h.binding_status("creds");
    assert!(status.condition_is_true("Failed"));
    assert_eq!(
        reason(&status, "Failed").as_deref(),
        Some("ErrorNonbindableServiceClass")
    );
    assert_eq!(h.broker.count(Call::Bind), 0);
}

#[tokio::test]
async fn test_injection_failure_unbinds_and_retries() {
    let h = Harness::new();
    h.ready_instance("db", "small").await;
    let mut merged = binding("creds", "db");
    merged.spec.secret_transforms = vec![SecretTransform::AddKeysFrom(AddKeysFromTransform {
        secret_ref: ObjectReference {
            namespace: None,
            name: "extra".to_string(),
        },
    })];
    h.bindings.create(merged).unwrap();

    assert_eq!(h.reconcile_binding("creds").await, ReconcileAction::RequeueNow);
    assert_eq!(
        reason(&h.binding_status("creds"), "Ready").as_deref(),
        Some("ErrorInjectingBindResult")
    );
    assert!(h.binding_status("creds").orphan_mitigation_in_progress);

    assert!(is_retry(h.reconcile_binding("creds").await));
    assert_eq!(h.broker.count(Call::Unbind), 1);

    h.secrets
        .insert(NAMESPACE, "extra", &[("region", b"eu".as_slice())]);
    assert_eq!(h.reconcile_binding("creds").await, ReconcileAction::Done);
    assert_eq!(secret_value(&h, "creds", "region").as_deref(), Some("eu"));
    assert_eq!(secret_value(&h, "creds", "username").as_deref(), Some("admin"));
    assert_eq!(h.broker.count(Call::Bind), 2);
}

#[tokio::test]
async fn test_spec_change_after_ready_only_records_generation() {
    let h = Harness::new();
    h.ready_instance("db", "small").await;
    h.ready_binding("creds", "db").await;

    h.bindings
        .update_spec(NAMESPACE, "creds", |b| {
            b.spec.parameters = Some(serde_json::json!({"role": "admin"}));
        })
        .unwrap();
    assert_eq!(h.reconcile_binding("creds").await, ReconcileAction::Done);

    let status = h.binding_status("creds");
    assert_eq!(status.reconciled_generation, Some(2));
    assert!(status.condition_is_true("Ready"));
    assert_eq!(h.broker.count(Call::Bind), 1);
}

#[tokio::test]
async fn test_delete_unbinds_and_removes_secret() {
    let h = Harness::new();
    h.ready_instance("db", "small").await;
    h.ready_binding("creds", "db").await;
    assert!(h.secrets.data(NAMESPACE, "creds").is_some());

    h.bindings.delete(NAMESPACE, "creds").unwrap();
    assert_eq!(h.reconcile_binding("creds").await, ReconcileAction::Done);

    assert_eq!(h.broker.count(Call::Unbind), 1);
    assert!(h.bindings.snapshot(NAMESPACE, "creds").is_none());
    assert!(h.secrets.data(NAMESPACE, "creds").is_none());
}

#[tokio::test]
async fn test_unbind_keeps_retrying_past_the_budget() {
    let h = Harness::with_config(ControllerConfig {
        reconciliation_retry_duration: Duration::ZERO,
        ..test_config()
    });
    h.ready_instance("db", "small").await;
    h.ready_binding("creds", "db").await;
    h.broker.script_operation(Call::Unbind, Err(http_error(500)));
    h.broker.script_operation(Call::Unbind, Err(http_error(503)));

    h.bindings.delete(NAMESPACE, "creds").unwrap();
    assert!(is_retry(h.reconcile_binding("creds").await));
    let status = h.binding_status("creds");
    assert_eq!(status.unbind_status, Some(UnbindStatus::FailedRetriable));
    assert_eq!(reason(&status, "Ready").as_deref(), Some("UnbindCallFailed"));
    assert!(!status.condition_is_true("Failed"));

    assert!(is_retry(h.reconcile_binding("creds").await));
    assert_eq!(h.binding_status("creds").operation_attempts, 2);
    assert!(h.secrets.data(NAMESPACE, "creds").is_some());

    assert_eq!(h.reconcile_binding("creds").await, ReconcileAction::Done);
    assert_eq!(h.broker.count(Call::Unbind), 3);
    assert!(h.bindings.snapshot(NAMESPACE, "creds").is_none());
    assert!(h.secrets.data(NAMESPACE, "creds").is_none());
}

#[tokio::test]
async fn test_unbind_succeeds_when_instance_is_gone() {
    let h = Harness::new();
    h.ready_instance("db", "small").await;
    h.ready_binding("creds", "db").await;

    h.instances.update_finalizers(&h.instance("db"), vec![]).await.unwrap();
    h.instances.delete(NAMESPACE, "db").unwrap();
    assert!(h.instances.snapshot(NAMESPACE, "db").is_none());

    h.bindings.delete(NAMESPACE, "creds").unwrap();
    assert_eq!(h.reconcile_binding("creds").await, ReconcileAction::Done);
    assert_eq!(h.broker.count(Call::Unbind), 0);
    assert!(h.bindings.snapshot(NAMESPACE, "creds").is_none());
}

#[tokio::test]
async fn test_instance_deprovisions_once_binding_is_removed() {
    let h = Harness::new();
    h.ready_instance("db", "small").await;
    h.ready_binding("creds", "db").await;

    h.instances.delete(NAMESPACE, "db").unwrap();
    h.bindings.delete(NAMESPACE, "creds").unwrap();

    assert!(matches!(
        h.reconcile_instance("db").await,
        ReconcileAction::Requeue {
            reason: RequeueReason::Blocked,
            ..
        }
    ));
    assert_eq!(h.reconcile_binding("creds").await, ReconcileAction::Done);
    assert_eq!(h.reconcile_instance("db").await, ReconcileAction::Done);

    assert_eq!(
        h.broker.operations(),
        vec![Call::Provision, Call::Bind, Call::Unbind, Call::Deprovision]
    );
    assert!(h.instances.snapshot(NAMESPACE, "db").is_none());
}

#[tokio::test]
async fn test_bind_refuses_secret_it_does_not_control() {
    let h = Harness::new();
    h.ready_instance("db", "small").await;
    h.secrets
        .insert(NAMESPACE, "creds", &[("token", b"abc".as_slice())]);
    h.bindings.create(binding("creds", "db")).unwrap();

    assert_eq!(h.reconcile_binding("creds").await, ReconcileAction::RequeueNow);
    assert_eq!(
        reason(&h.binding_status("creds"), "Ready").as_deref(),
        Some("ErrorInjectingBindResult")
    );

    assert_eq!(h.settle_binding("creds").await, ReconcileAction::Done);
    let status = h.binding_status("creds");
    assert!(status.condition_is_true("Failed"));
    assert_eq!(
        reason(&status, "Failed").as_deref(),
        Some("ErrorInjectingBindResult")
    );
    assert_eq!(h.broker.count(Call::Unbind), 1);
    assert_eq!(secret_value(&h, "creds", "token").as_deref(), Some("abc"));
    assert!(secret_value(&h, "creds", "password").is_none());
    assert!(h.secrets.owner(NAMESPACE, "creds").is_none());

    h.bindings.delete(NAMESPACE, "creds").unwrap();
    assert_eq!(h.reconcile_binding("creds").await, ReconcileAction::Done);
    assert!(h.bindings.snapshot(NAMESPACE, "creds").is_none());
    assert_eq!(secret_value(&h, "creds", "token").as_deref(), Some("abc"));
}

#[tokio::test]
async fn test_release_leaves_unowned_secret_in_place() {
    let h = Harness::new();
    h.secrets
        .insert(NAMESPACE, "creds", &[("token", b"abc".as_slice())]);
    h.bindings.create(binding("creds", "db")).unwrap();
    assert_eq!(h.reconcile_binding("creds").await, ReconcileAction::Done);

    h.bindings.delete(NAMESPACE, "creds").unwrap();
    assert_eq!(h.reconcile_binding("creds").await, ReconcileAction::Done);

    assert!(h.bindings.snapshot(NAMESPACE, "creds").is_none());
    assert_eq!(secret_value(&h, "creds", "token").as_deref(), Some("abc"));
    assert_eq!(h.broker.count(Call::Unbind), 0);
}

#[tokio::test]
async fn test_failed_asynchronous_unbind_is_retried() {
    let h = Harness::new();
    h.ready_instance("db", "small").await;
    h.ready_binding("creds", "db").await;
    h.broker
        .script_operation(Call::Unbind, Ok(accepted("unbind-1")));
    h.broker.script_poll(
        Call::PollBinding,
        Ok(last_operation(LastOperationState::Failed)),
    );

    h.bindings.delete(NAMESPACE, "creds").unwrap();
    assert!(is_poll(h.reconcile_binding("creds").await));
    let status = h.binding_status("creds");
    assert!(status.async_op_in_progress);
    assert_eq!(status.current_operation, Some(BindingOperation::Unbind));
    assert_eq!(status.last_operation.as_deref(), Some("unbind-1"));

    assert!(is_retry(h.reconcile_binding("creds").await));
    let status = h.binding_status("creds");
    assert!(!status.async_op_in_progress);
    assert_eq!(reason(&status, "Ready").as_deref(), Some("UnbindCallFailed"));
    assert!(h.secrets.data(NAMESPACE, "creds").is_some());

    assert_eq!(h.reconcile_binding("creds").await, ReconcileAction::Done);
    assert!(h.broker.count(Call::Unbind) > 1);
    assert!(h.bindings.snapshot(NAMESPACE, "creds").is_none());
    assert!(h.secrets.data(NAMESPACE, "creds").is_none());
}
