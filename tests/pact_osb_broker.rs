//! Pact contract tests for the Open Service Broker API
//!
//! These tests define the contract between the Service Catalog Controller and
//! an OSB broker. The HTTP broker client is pointed at a Pact mock server, so
//! every interaction is exercised through the same code path the controller
//! uses at runtime.

#[cfg(test)]
mod common;

use common::init_rustls;
use std::sync::Once;

static RUSTLS_INIT: Once = Once::new();

/// Initialize rustls before tests
fn init() {
    RUSTLS_INIT.call_once(|| {
        init_rustls();
    });
}

use pact_consumer::prelude::*;
use serde_json::json;
use service_catalog_controller::broker::http::{BasicAuth, HttpBrokerClient};
use service_catalog_controller::broker::{
    BindRequest, BrokerClient, BrokerError, DeprovisionRequest, LastOperationRequest,
    LastOperationState, ProvisionRequest, UnbindRequest,
};
use std::time::Duration;

const CONSUMER: &str = "Service-Catalog-Controller";
const PROVIDER: &str = "OSB-Broker";
const API_VERSION: &str = "2.13";
// base64("admin:s3cret")
const AUTHORIZATION: &str = "Basic YWRtaW46czNjcmV0";

fn client_for(
    mock_server: &dyn pact_consumer::mock_server::ValidatingMockServer,
) -> HttpBrokerClient {
    // mock_server.url() ends with a slash; the client trims it
    let base_url = mock_server.url().to_string();
    HttpBrokerClient::new(
        &base_url,
        API_VERSION,
        Some(BasicAuth {
            username: "admin".to_string(),
            password: "s3cret".to_string(),
        }),
        Duration::from_secs(10),
    )
    .expect("Failed to create broker client")
}

fn provision_request() -> ProvisionRequest {
    ProvisionRequest {
        instance_id: "inst-1".to_string(),
        service_id: "svc-db".to_string(),
        plan_id: "plan-small".to_string(),
        organization_guid: "test-cluster".to_string(),
        space_guid: "default".to_string(),
        parameters: None,
        context: json!({
            "platform": "kubernetes",
            "namespace": "default",
            "clusterid": "test-cluster"
        }),
        originating_identity: None,
    }
}

fn provision_body() -> serde_json::Value {
    json!({
        "service_id": "svc-db",
        "plan_id": "plan-small",
        "organization_guid": "test-cluster",
        "space_guid": "default",
        "context": {
            "platform": "kubernetes",
            "namespace": "default",
            "clusterid": "test-cluster"
        }
    })
}

#[tokio::test]
async fn test_osb_get_catalog_contract() {
    init();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);

    pact_builder.interaction("fetch the broker catalog", "", |mut i| {
        i.given("the broker offers a database service");
        i.request
            .method("GET")
            .path("/v2/catalog")
            .header("X-Broker-API-Version", API_VERSION)
            .header("authorization", AUTHORIZATION);
        i.response
            .status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "services": [{
                    "id": "svc-db",
                    "name": "database",
                    "description": "Managed database",
                    "bindable": true,
                    "plans": [
                        {"id": "plan-small", "name": "small", "description": "Small"},
                        {"id": "plan-archive", "name": "archive", "description": "Archive", "bindable": false}
                    ]
                }]
            }));
        i
    });

    let mock_server = pact_builder.start_mock_server(None, None);
    let client = client_for(mock_server.as_ref());

    let catalog = client.get_catalog().await.expect("Failed to fetch catalog");
    assert_eq!(catalog.services.len(), 1);
    assert_eq!(catalog.services[0].name, "database");
    assert_eq!(catalog.services[0].plans.len(), 2);
    assert_eq!(catalog.services[0].plans[1].bindable, Some(false));
}

#[tokio::test]
async fn test_osb_synchronous_provision_contract() {
    init();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);

    pact_builder.interaction("provision an instance synchronously", "", |mut i| {
        i.given("no instance inst-1 exists");
        i.request
            .method("PUT")
            .path("/v2/service_instances/inst-1")
            .query_param("accepts_incomplete", "true")
            .header("X-Broker-API-Version", API_VERSION)
            .header("authorization", AUTHORIZATION)
            .json_body(provision_body());
        i.response
            .status(201)
            .header("content-type", "application/json")
            .json_body(json!({
                "dashboard_url": "https://dashboard.example.com/inst-1"
            }));
        i
    });

    let mock_server = pact_builder.start_mock_server(None, None);
    let client = client_for(mock_server.as_ref());

    let response = client
        .provision_instance(&provision_request())
        .await
        .expect("Failed to provision");
    assert!(!response.is_async);
    assert_eq!(
        response.dashboard_url.as_deref(),
        Some("https://dashboard.example.com/inst-1")
    );
}

#[tokio::test]
async fn test_osb_asynchronous_provision_contract() {
    init();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);

    pact_builder.interaction("provision an instance asynchronously", "", |mut i| {
        i.given("the broker provisions asynchronously");
        i.request
            .method("PUT")
            .path("/v2/service_instances/inst-1")
            .query_param("accepts_incomplete", "true")
            .header("X-Broker-API-Version", API_VERSION)
            .json_body(provision_body());
        i.response
            .status(202)
            .header("content-type", "application/json")
            .json_body(json!({"operation": "task-1"}));
        i
    });

    let mock_server = pact_builder.start_mock_server(None, None);
    let client = client_for(mock_server.as_ref());

    let response = client
        .provision_instance(&provision_request())
        .await
        .expect("Failed to provision");
    assert!(response.is_async);
    assert_eq!(response.operation.as_deref(), Some("task-1"));
}

#[tokio::test]
async fn test_osb_provision_rejected_contract() {
    init();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);

    pact_builder.interaction("reject a provision with bad parameters", "", |mut i| {
        i.given("the broker rejects the request");
        i.request
            .method("PUT")
            .path("/v2/service_instances/inst-1")
            .query_param("accepts_incomplete", "true")
            .json_body(provision_body());
        i.response
            .status(400)
            .header("content-type", "application/json")
            .json_body(json!({
                "error": "BadRequest",
                "description": "plan does not support this region"
            }));
        i
    });

    let mock_server = pact_builder.start_mock_server(None, None);
    let client = client_for(mock_server.as_ref());

    let result = client.provision_instance(&provision_request()).await;
    match result {
        Err(BrokerError::Http {
            status,
            error,
            description,
        }) => {
            assert_eq!(status, 400);
            assert_eq!(error.as_deref(), Some("BadRequest"));
            assert_eq!(
                description.as_deref(),
                Some("plan does not support this region")
            );
        }
        other => panic!("Expected HTTP 400, got {other:?}"),
    }
}

#[tokio::test]
async fn test_osb_last_operation_contract() {
    init();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);

    pact_builder.interaction("poll an in-progress provision", "", |mut i| {
        i.given("instance inst-1 is being provisioned");
        i.request
            .method("GET")
            .path("/v2/service_instances/inst-1/last_operation")
            .query_param("service_id", "svc-db")
            .query_param("plan_id", "plan-small")
            .query_param("operation", "task-1")
            .header("X-Broker-API-Version", API_VERSION);
        i.response
            .status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "state": "in progress",
                "description": "creating database"
            }));
        i
    });

    let mock_server = pact_builder.start_mock_server(None, None);
    let client = client_for(mock_server.as_ref());

    let response = client
        .poll_last_operation(&LastOperationRequest {
            instance_id: "inst-1".to_string(),
            binding_id: None,
            service_id: Some("svc-db".to_string()),
            plan_id: Some("plan-small".to_string()),
            operation: Some("task-1".to_string()),
            originating_identity: None,
        })
        .await
        .expect("Failed to poll");
    assert_eq!(response.state, LastOperationState::InProgress);
    assert_eq!(response.description.as_deref(), Some("creating database"));
}

#[tokio::test]
async fn test_osb_deprovision_gone_contract() {
    init();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);

    pact_builder.interaction("deprovision an instance the broker no longer has", "", |mut i| {
        i.given("instance inst-1 does not exist");
        i.request
            .method("DELETE")
            .path("/v2/service_instances/inst-1")
            .query_param("accepts_incomplete", "true")
            .query_param("service_id", "svc-db")
            .query_param("plan_id", "plan-small")
            .header("X-Broker-API-Version", API_VERSION);
        i.response
            .status(410)
            .header("content-type", "application/json")
            .json_body(json!({}));
        i
    });

    let mock_server = pact_builder.start_mock_server(None, None);
    let client = client_for(mock_server.as_ref());

    let result = client
        .deprovision_instance(&DeprovisionRequest {
            instance_id: "inst-1".to_string(),
            service_id: "svc-db".to_string(),
            plan_id: "plan-small".to_string(),
            originating_identity: None,
        })
        .await;
    assert!(matches!(result, Err(BrokerError::Http { status: 410, .. })));
}

#[tokio::test]
async fn test_osb_bind_contract() {
    init();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);

    pact_builder.interaction("bind to a provisioned instance", "", |mut i| {
        i.given("instance inst-1 is provisioned");
        i.request
            .method("PUT")
            .path("/v2/service_instances/inst-1/service_bindings/bind-1")
            .query_param("accepts_incomplete", "true")
            .header("X-Broker-API-Version", API_VERSION)
            .json_body(json!({
                "service_id": "svc-db",
                "plan_id": "plan-small",
                "context": {
                    "platform": "kubernetes",
                    "namespace": "default",
                    "clusterid": "test-cluster"
                },
                "parameters": {"role": "reader"}
            }));
        i.response
            .status(201)
            .header("content-type", "application/json")
            .json_body(json!({
                "credentials": {
                    "username": "admin",
                    "password": "s3cret",
                    "port": 5432
                }
            }));
        i
    });

    let mock_server = pact_builder.start_mock_server(None, None);
    let client = client_for(mock_server.as_ref());

    let mut parameters = serde_json::Map::new();
    parameters.insert("role".to_string(), json!("reader"));
    let response = client
        .bind(&BindRequest {
            instance_id: "inst-1".to_string(),
            binding_id: "bind-1".to_string(),
            service_id: "svc-db".to_string(),
            plan_id: "plan-small".to_string(),
            parameters: Some(parameters),
            context: json!({
                "platform": "kubernetes",
                "namespace": "default",
                "clusterid": "test-cluster"
            }),
            originating_identity: None,
        })
        .await
        .expect("Failed to bind");
    assert!(!response.is_async);
    let credentials = response.credentials.expect("Bind returned no credentials");
    assert_eq!(credentials["username"], "admin");
    assert_eq!(credentials["port"], 5432);
}

#[tokio::test]
async fn test_osb_unbind_contract() {
    init();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);

    pact_builder.interaction("unbind an existing binding", "", |mut i| {
        i.given("binding bind-1 exists");
        i.request
            .method("DELETE")
            .path("/v2/service_instances/inst-1/service_bindings/bind-1")
            .query_param("accepts_incomplete", "true")
            .query_param("service_id", "svc-db")
            .query_param("plan_id", "plan-small")
            .header("X-Broker-API-Version", API_VERSION);
        i.response
            .status(200)
            .header("content-type", "application/json")
            .json_body(json!({}));
        i
    });

    let mock_server = pact_builder.start_mock_server(None, None);
    let client = client_for(mock_server.as_ref());

    let response = client
        .unbind(&UnbindRequest {
            instance_id: "inst-1".to_string(),
            binding_id: "bind-1".to_string(),
            service_id: "svc-db".to_string(),
            plan_id: "plan-small".to_string(),
            originating_identity: None,
        })
        .await
        .expect("Failed to unbind");
    assert!(!response.is_async);
}

/// Ids with reserved characters must reach the broker intact
#[tokio::test]
async fn test_osb_deprovision_escapes_query_contract() {
    init();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);

    pact_builder.interaction("deprovision with reserved characters in the plan id", "", |mut i| {
        i.given("instance inst-1 is provisioned");
        i.request
            .method("DELETE")
            .path("/v2/service_instances/inst-1")
            .query_param("accepts_incomplete", "true")
            .query_param("service_id", "svc/db?v=2")
            .query_param("plan_id", "plan small&fast=1")
            .header("X-Broker-API-Version", API_VERSION);
        i.response
            .status(202)
            .header("content-type", "application/json")
            .json_body(json!({"operation": "deprovision-1"}));
        i
    });

    let mock_server = pact_builder.start_mock_server(None, None);
    let client = client_for(mock_server.as_ref());

    let response = client
        .deprovision_instance(&DeprovisionRequest {
            instance_id: "inst-1".to_string(),
            service_id: "svc/db?v=2".to_string(),
            plan_id: "plan small&fast=1".to_string(),
            originating_identity: None,
        })
        .await
        .expect("Failed to deprovision");
    assert!(response.is_async);
    assert_eq!(response.operation.as_deref(), Some("deprovision-1"));
}

#[tokio::test]
async fn test_osb_unbind_no_content_contract() {
    init();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);

    pact_builder.interaction("unbind answered with no content", "", |mut i| {
        i.given("binding bind-1 exists");
        i.request
            .method("DELETE")
            .path("/v2/service_instances/inst-1/service_bindings/bind-1")
            .query_param("accepts_incomplete", "true")
            .query_param("service_id", "svc-db")
            .query_param("plan_id", "plan small&fast=1")
            .header("X-Broker-API-Version", API_VERSION);
        i.response.status(204);
        i
    });

    let mock_server = pact_builder.start_mock_server(None, None);
    let client = client_for(mock_server.as_ref());

    let response = client
        .unbind(&UnbindRequest {
            instance_id: "inst-1".to_string(),
            binding_id: "bind-1".to_string(),
            service_id: "svc-db".to_string(),
            plan_id: "plan small&fast=1".to_string(),
            originating_identity: None,
        })
        .await
        .expect("Failed to unbind");
    assert!(!response.is_async);
    assert!(response.operation.is_none());
}
