//! The host client: a typed adaptor over one LXD host's REST API.

use std::time::Instant;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::HostConfig;
use crate::error::LxdError;
use crate::metrics_hook::observe_api_call;
use crate::types::{
    ExecResult, Instance, InstancePut, InstanceSpec, ServerResources, StateAction,
};

/// Capability interface over a single container host.
///
/// Long-running operations (create/delete/state change) are awaited inside
/// the call. Cancelling a caller's deadline cancels the wait, not the
/// operation on the host; callers must treat that as "uncertain" and
/// reconcile with a follow-up `get_instance`.
#[async_trait]
pub trait HostClient: Send + Sync {
    async fn list_instances(&self) -> Result<Vec<Instance>, LxdError>;

    /// Fetch one instance together with its version token (ETag).
    async fn get_instance(&self, name: &str) -> Result<(Instance, String), LxdError>;

    /// Replace an instance's mutable config, compare-and-swap on the
    /// version token. A stale token yields [`LxdError::PreconditionFailed`].
    async fn update_instance(
        &self,
        name: &str,
        put: InstancePut,
        etag: &str,
    ) -> Result<(), LxdError>;

    async fn set_state(&self, name: &str, action: StateAction) -> Result<(), LxdError>;

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<(), LxdError>;

    async fn delete_instance(&self, name: &str) -> Result<(), LxdError>;

    async fn push_file(
        &self,
        instance: &str,
        path: &str,
        data: &[u8],
        mode: u32,
    ) -> Result<(), LxdError>;

    async fn exec(&self, instance: &str, command: &[String]) -> Result<ExecResult, LxdError>;

    async fn server_resources(&self) -> Result<ServerResources, LxdError>;
}

/// Response envelope shared by every LXD endpoint.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    operation: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_code: i64,
    metadata: Option<T>,
}

#[derive(Debug, Deserialize)]
struct OperationData {
    #[serde(default)]
    status: String,
    #[serde(default)]
    status_code: i64,
    #[serde(default)]
    err: String,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ServerInfo {
    environment: ServerEnvironment,
}

#[derive(Debug, Deserialize)]
struct ServerEnvironment {
    #[serde(default)]
    server_name: String,
}

#[derive(Debug, Deserialize)]
struct HostResources {
    cpu: ResourceTotal,
    memory: ResourceTotal,
}

#[derive(Debug, Deserialize)]
struct ResourceTotal {
    #[serde(default)]
    total: u64,
}

const OPERATION_SUCCESS: i64 = 200;

/// REST implementation of [`HostClient`] with client-certificate TLS.
pub struct LxdClient {
    host: String,
    http: reqwest::Client,
}

impl LxdClient {
    pub fn new(config: &HostConfig) -> Result<Self, LxdError> {
        let pem = format!("{}\n{}", config.client_cert, config.client_key);
        let identity = reqwest::Identity::from_pem(pem.as_bytes())?;
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .danger_accept_invalid_certs(true)
            .connect_timeout(crate::connect::CONNECT_TIMEOUT)
            .user_agent("frost")
            .build()?;

        Ok(Self {
            host: config.host.clone(),
            http,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.host, path)
    }

    /// Probe the API root; used by connect to verify reachability.
    pub(crate) async fn ping(&self) -> Result<(), LxdError> {
        self.request_json::<serde_json::Value>(self.http.get(self.url("/1.0")))
            .await?;
        Ok(())
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<(T, String), LxdError> {
        let response = builder.send().await?;
        let status = response.status();
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(LxdError::NotFound);
        }
        if status == reqwest::StatusCode::PRECONDITION_FAILED {
            return Err(LxdError::PreconditionFailed);
        }

        let body: ApiResponse<T> = response.json().await?;
        if body.kind == "error" {
            if body.error_code == 404 {
                return Err(LxdError::NotFound);
            }
            if body.error_code == 412 {
                return Err(LxdError::PreconditionFailed);
            }
            return Err(LxdError::Api {
                code: body.error_code,
                message: body.error,
            });
        }

        let metadata = body
            .metadata
            .ok_or_else(|| LxdError::InvalidResponse("missing metadata".to_string()))?;
        Ok((metadata, etag))
    }

    /// Fire a request that spawns a background operation and wait for it.
    /// Returns the operation metadata (exec uses it for the exit code).
    async fn request_operation(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<Option<serde_json::Value>, LxdError> {
        let response = builder.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(LxdError::NotFound);
        }
        if status == reqwest::StatusCode::PRECONDITION_FAILED {
            return Err(LxdError::PreconditionFailed);
        }

        let body: ApiResponse<serde_json::Value> = response.json().await?;
        if body.kind == "error" {
            if body.error_code == 404 {
                return Err(LxdError::NotFound);
            }
            if body.error_code == 412 {
                return Err(LxdError::PreconditionFailed);
            }
            return Err(LxdError::Api {
                code: body.error_code,
                message: body.error,
            });
        }

        if body.operation.is_empty() {
            return Ok(body.metadata);
        }
        self.wait_operation(&body.operation).await
    }

    async fn wait_operation(&self, operation: &str) -> Result<Option<serde_json::Value>, LxdError> {
        let url = format!("{}{}/wait", self.host, operation);
        let (op, _) = self.request_json::<OperationData>(self.http.get(url)).await?;

        if op.status_code == OPERATION_SUCCESS {
            return Ok(op.metadata);
        }
        let message = if op.err.is_empty() { op.status } else { op.err };
        Err(LxdError::Operation(message))
    }

    /// Best-effort fetch of an exec output log; exec output is advisory.
    async fn fetch_exec_log(&self, api_path: &str) -> String {
        let response = match self.http.get(self.url(api_path)).send().await {
            Ok(r) => r,
            Err(_) => return String::new(),
        };
        if !response.status().is_success() {
            return String::new();
        }
        response.text().await.unwrap_or_default()
    }
}

#[async_trait]
impl HostClient for LxdClient {
    async fn list_instances(&self) -> Result<Vec<Instance>, LxdError> {
        let started = Instant::now();
        let result = self
            .request_json::<Vec<Instance>>(
                self.http
                    .get(self.url("/1.0/instances"))
                    .query(&[("recursion", "1")]),
            )
            .await
            .map(|(instances, _)| instances);
        observe_api_call(&self.host, "ListInstances", started, result.is_ok());
        result
    }

    async fn get_instance(&self, name: &str) -> Result<(Instance, String), LxdError> {
        let started = Instant::now();
        let result = self
            .request_json::<Instance>(self.http.get(self.url(&format!("/1.0/instances/{name}"))))
            .await;
        observe_api_call(&self.host, "GetInstance", started, result.is_ok());
        result
    }

    async fn update_instance(
        &self,
        name: &str,
        put: InstancePut,
        etag: &str,
    ) -> Result<(), LxdError> {
        let started = Instant::now();
        let mut builder = self
            .http
            .put(self.url(&format!("/1.0/instances/{name}")))
            .json(&put);
        if !etag.is_empty() {
            builder = builder.header(reqwest::header::IF_MATCH, etag);
        }
        let result = self.request_operation(builder).await.map(|_| ());
        observe_api_call(&self.host, "UpdateInstance", started, result.is_ok());
        result
    }

    async fn set_state(&self, name: &str, action: StateAction) -> Result<(), LxdError> {
        let started = Instant::now();
        let body = serde_json::json!({
            "action": action.as_str(),
            "timeout": -1,
            "force": action == StateAction::Stop,
        });
        let result = self
            .request_operation(
                self.http
                    .put(self.url(&format!("/1.0/instances/{name}/state")))
                    .json(&body),
            )
            .await
            .map(|_| ());
        observe_api_call(&self.host, "UpdateInstanceState", started, result.is_ok());
        result
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<(), LxdError> {
        let started = Instant::now();
        let result = self
            .request_operation(self.http.post(self.url("/1.0/instances")).json(spec))
            .await
            .map(|_| ());
        observe_api_call(&self.host, "CreateInstance", started, result.is_ok());
        result
    }

    async fn delete_instance(&self, name: &str) -> Result<(), LxdError> {
        let started = Instant::now();
        let result = self
            .request_operation(self.http.delete(self.url(&format!("/1.0/instances/{name}"))))
            .await
            .map(|_| ());
        observe_api_call(&self.host, "DeleteInstance", started, result.is_ok());
        result
    }

    async fn push_file(
        &self,
        instance: &str,
        path: &str,
        data: &[u8],
        mode: u32,
    ) -> Result<(), LxdError> {
        let started = Instant::now();
        let result = async {
            let response = self
                .http
                .post(self.url(&format!("/1.0/instances/{instance}/files")))
                .query(&[("path", path)])
                .header("X-LXD-type", "file")
                .header("X-LXD-mode", format!("{mode:04o}"))
                .header("X-LXD-write", "overwrite")
                .body(data.to_vec())
                .send()
                .await?;

            if response.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(LxdError::NotFound);
            }
            let body: ApiResponse<serde_json::Value> = response.json().await?;
            if body.kind == "error" {
                return Err(LxdError::Api {
                    code: body.error_code,
                    message: body.error,
                });
            }
            Ok(())
        }
        .await;
        observe_api_call(&self.host, "CreateInstanceFile", started, result.is_ok());
        result
    }

    async fn exec(&self, instance: &str, command: &[String]) -> Result<ExecResult, LxdError> {
        let started = Instant::now();
        let result = async {
            let body = serde_json::json!({
                "command": command,
                "wait-for-websocket": false,
                "record-output": true,
                "interactive": false,
            });
            let metadata = self
                .request_operation(
                    self.http
                        .post(self.url(&format!("/1.0/instances/{instance}/exec")))
                        .json(&body),
                )
                .await?
                .ok_or_else(|| LxdError::InvalidResponse("exec without metadata".to_string()))?;

            let exit_code = metadata
                .get("return")
                .and_then(serde_json::Value::as_i64)
                .ok_or_else(|| {
                    LxdError::InvalidResponse("exec metadata without return code".to_string())
                })?;

            let mut exec_result = ExecResult {
                exit_code,
                ..Default::default()
            };
            if let Some(output) = metadata.get("output") {
                if let Some(path) = output.get("1").and_then(serde_json::Value::as_str) {
                    exec_result.stdout = self.fetch_exec_log(path).await;
                }
                if let Some(path) = output.get("2").and_then(serde_json::Value::as_str) {
                    exec_result.stderr = self.fetch_exec_log(path).await;
                }
            }
            Ok(exec_result)
        }
        .await;
        observe_api_call(&self.host, "ExecInstance", started, result.is_ok());
        result
    }

    async fn server_resources(&self) -> Result<ServerResources, LxdError> {
        let started = Instant::now();
        let result = async {
            let (resources, _) = self
                .request_json::<HostResources>(self.http.get(self.url("/1.0/resources")))
                .await?;
            let (server, _) = self
                .request_json::<ServerInfo>(self.http.get(self.url("/1.0")))
                .await?;

            Ok(ServerResources {
                cpu_total: resources.cpu.total,
                memory_total: resources.memory.total,
                hostname: server.environment.server_name,
            })
        }
        .await;
        observe_api_call(&self.host, "GetServerResources", started, result.is_ok());
        result
    }
}
