//! # OSB HTTP Client
//!
//! reqwest implementation of [`BrokerClient`] for the Open Service Broker API v2.
//!
//! This implementation:
//! - Uses reqwest with rustls (no OpenSSL dependencies)
//! - Sends `X-Broker-API-Version` on every request and the originating identity when known
//! - Always sets `accepts_incomplete=true` so brokers may answer asynchronously
//!
//! References:
//! - [Open Service Broker API](https://github.com/openservicebrokerapi/servicebroker/blob/master/spec.md)

use crate::broker::{
    BindRequest, BindResponse, BrokerClient, BrokerError, Catalog, DeprovisionRequest,
    GetBindingRequest, LastOperationRequest, LastOperationResponse, OperationResponse,
    OriginatingIdentity, ProvisionRequest, TransportErrorKind, UnbindRequest,
    UpdateInstanceRequest,
};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::debug;

const API_VERSION_HEADER: &str = "X-Broker-API-Version";
const ORIGINATING_IDENTITY_HEADER: &str = "X-Broker-API-Originating-Identity";
const ACCEPTS_INCOMPLETE: (&str, &str) = ("accepts_incomplete", "true");

/// HTTP basic auth credentials of a broker
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// OSB REST client for one broker
pub struct HttpBrokerClient {
    http_client: Client,
    base_url: String,
    api_version: String,
    auth: Option<BasicAuth>,
}

impl std::fmt::Debug for HttpBrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBrokerClient")
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct OperationBody {
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    dashboard_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct BindingBody {
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    credentials: Option<Map<String, Value>>,
}

impl HttpBrokerClient {
    /// Create a client for the broker at `base_url`
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built
    pub fn new(
        base_url: &str,
        api_version: &str,
        auth: Option<BasicAuth>,
        timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BrokerError::Transport {
                kind: TransportErrorKind::Other,
                message: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_version: api_version.to_string(),
            auth,
        })
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        identity: Option<&OriginatingIdentity>,
    ) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!("OSB {} {}", method, url);
        let mut builder = self
            .http_client
            .request(method, url)
            .header(API_VERSION_HEADER, &self.api_version);
        if let Some(auth) = &self.auth {
            builder = builder.basic_auth(&auth.username, Some(&auth.password));
        }
        if let Some(identity) = identity {
            builder = builder.header(ORIGINATING_IDENTITY_HEADER, identity.header_value());
        }
        builder
    }

    async fn send(builder: RequestBuilder) -> Result<Response, BrokerError> {
        builder.send().await.map_err(transport_error)
    }

    /// Read a response accepted with one of `accepted`, returning the status and body
    async fn read<T: DeserializeOwned + Default>(
        response: Response,
        accepted: &[u16],
    ) -> Result<(u16, T), BrokerError> {
        let status = response.status().as_u16();
        let text = response.text().await.map_err(transport_error)?;
        if !accepted.contains(&status) {
            let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
            return Err(BrokerError::Http {
                status,
                error: body.error,
                description: body.description,
            });
        }
        if text.trim().is_empty() {
            return Ok((status, T::default()));
        }
        let body = serde_json::from_str(&text)
            .map_err(|e| BrokerError::InvalidResponse(format!("HTTP {status}: {e}")))?;
        Ok((status, body))
    }

    /// Send an instance or binding operation with `accepts_incomplete=true`
    /// plus `query`; deletions also accept an empty `204`
    async fn operation(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
        identity: Option<&OriginatingIdentity>,
    ) -> Result<OperationResponse, BrokerError> {
        let accepted: &[u16] = if method == Method::DELETE {
            &[200, 202, 204]
        } else {
            &[200, 201, 202]
        };
        let mut builder = self
            .request(method, path, identity)
            .query(&[ACCEPTS_INCOMPLETE])
            .query(query);
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        let response = Self::send(builder).await?;
        let (status, body): (u16, OperationBody) = Self::read(response, accepted).await?;
        Ok(OperationResponse {
            is_async: status == 202,
            operation: body.operation,
            dashboard_url: body.dashboard_url,
        })
    }

    async fn last_operation(
        &self,
        path: String,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError> {
        let query: Vec<(&str, &str)> = [
            ("service_id", request.service_id.as_deref()),
            ("plan_id", request.plan_id.as_deref()),
            ("operation", request.operation.as_deref()),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k, v)))
        .collect();
        let builder = self
            .request(Method::GET, &path, request.originating_identity.as_ref())
            .query(&query);
        let response = Self::send(builder).await?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(transport_error)?;
        if status != 200 {
            let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
            return Err(BrokerError::Http {
                status,
                error: body.error,
                description: body.description,
            });
        }
        serde_json::from_str(&text).map_err(|e| BrokerError::InvalidResponse(e.to_string()))
    }
}

fn transport_error(error: reqwest::Error) -> BrokerError {
    let kind = if error.is_timeout() {
        TransportErrorKind::Timeout
    } else if error.is_connect() {
        TransportErrorKind::Connect
    } else {
        TransportErrorKind::Other
    };
    BrokerError::Transport {
        kind,
        message: error.to_string(),
    }
}

fn instance_path(instance_id: &str) -> String {
    format!("/v2/service_instances/{instance_id}")
}

fn binding_path(instance_id: &str, binding_id: &str) -> String {
    format!("/v2/service_instances/{instance_id}/service_bindings/{binding_id}")
}

fn with_parameters(mut body: Value, parameters: Option<&Map<String, Value>>) -> Value {
    if let Some(parameters) = parameters {
        body["parameters"] = Value::Object(parameters.clone());
    }
    body
}

#[async_trait]
impl BrokerClient for HttpBrokerClient {
    async fn get_catalog(&self) -> Result<Catalog, BrokerError> {
        let response = Self::send(self.request(Method::GET, "/v2/catalog", None)).await?;
        let (_, catalog) = Self::read(response, &[200]).await?;
        Ok(catalog)
    }

    async fn provision_instance(
        &self,
        request: &ProvisionRequest,
    ) -> Result<OperationResponse, BrokerError> {
        let body = with_parameters(
            json!({
                "service_id": request.service_id,
                "plan_id": request.plan_id,
                "organization_guid": request.organization_guid,
                "space_guid": request.space_guid,
                "context": request.context,
            }),
            request.parameters.as_ref(),
        );
        self.operation(
            Method::PUT,
            &instance_path(&request.instance_id),
            &[],
            Some(body),
            request.originating_identity.as_ref(),
        )
        .await
    }

    async fn update_instance(
        &self,
        request: &UpdateInstanceRequest,
    ) -> Result<OperationResponse, BrokerError> {
        let mut body = with_parameters(
            json!({
                "service_id": request.service_id,
                "context": request.context,
            }),
            request.parameters.as_ref(),
        );
        if let Some(plan_id) = &request.plan_id {
            body["plan_id"] = Value::String(plan_id.clone());
        }
        self.operation(
            Method::PATCH,
            &instance_path(&request.instance_id),
            &[],
            Some(body),
            request.originating_identity.as_ref(),
        )
        .await
    }

    async fn deprovision_instance(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<OperationResponse, BrokerError> {
        self.operation(
            Method::DELETE,
            &instance_path(&request.instance_id),
            &[
                ("service_id", request.service_id.as_str()),
                ("plan_id", request.plan_id.as_str()),
            ],
            None,
            request.originating_identity.as_ref(),
        )
        .await
    }

    async fn poll_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError> {
        let path = format!("{}/last_operation", instance_path(&request.instance_id));
        self.last_operation(path, request).await
    }

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, BrokerError> {
        let body = with_parameters(
            json!({
                "service_id": request.service_id,
                "plan_id": request.plan_id,
                "context": request.context,
            }),
            request.parameters.as_ref(),
        );
        let path = binding_path(&request.instance_id, &request.binding_id);
        let builder = self
            .request(Method::PUT, &path, request.originating_identity.as_ref())
            .query(&[ACCEPTS_INCOMPLETE])
            .json(&body);
        let response = Self::send(builder).await?;
        let (status, body): (u16, BindingBody) = Self::read(response, &[200, 201, 202]).await?;
        Ok(BindResponse {
            is_async: status == 202,
            operation: body.operation,
            credentials: body.credentials,
        })
    }

    async fn unbind(&self, request: &UnbindRequest) -> Result<OperationResponse, BrokerError> {
        self.operation(
            Method::DELETE,
            &binding_path(&request.instance_id, &request.binding_id),
            &[
                ("service_id", request.service_id.as_str()),
                ("plan_id", request.plan_id.as_str()),
            ],
            None,
            request.originating_identity.as_ref(),
        )
        .await
    }

    async fn get_binding(&self, request: &GetBindingRequest) -> Result<BindResponse, BrokerError> {
        let path = binding_path(&request.instance_id, &request.binding_id);
        let response = Self::send(self.request(Method::GET, &path, None)).await?;
        let (_, body): (u16, BindingBody) = Self::read(response, &[200]).await?;
        Ok(BindResponse {
            is_async: false,
            operation: None,
            credentials: body.credentials,
        })
    }

    async fn poll_binding_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError> {
        let binding_id = request.binding_id.as_deref().ok_or_else(|| {
            BrokerError::InvalidResponse("binding poll requires a binding id".to_string())
        })?;
        let path = format!(
            "{}/last_operation",
            binding_path(&request.instance_id, binding_id)
        );
        self.last_operation(path, request).await
    }
}
