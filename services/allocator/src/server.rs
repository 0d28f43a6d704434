//! gRPC service wiring: request validation, host resolution, metrics.

use std::sync::Arc;
use std::time::Instant;

use tonic::{Request, Response, Status};
use tracing::warn;

use frost_lxd::{connect_hosts, LxdHost};
use frost_proto::allocator::v1::{
    AddInstanceRequest, AddInstanceResponse, Allocator, DeleteInstanceRequest,
    DeleteInstanceResponse,
};
use frost_store::{ResourceCache, Store};

use crate::config::Config;
use crate::metrics;
use crate::scheduler_client::SchedulerClient;

pub struct AllocatorService {
    pub(crate) config: Arc<Config>,
    pub(crate) cache: ResourceCache,
    pub(crate) scheduler: Option<SchedulerClient>,
}

impl AllocatorService {
    pub fn new(config: Arc<Config>, store: Arc<dyn Store>) -> Self {
        let scheduler = config
            .scheduler_url
            .clone()
            .map(SchedulerClient::new);

        Self {
            config,
            cache: ResourceCache::new(store),
            scheduler,
        }
    }

    /// Resolve requested target hosts against the fleet map and connect to
    /// the survivors in parallel. Unknown names are dropped; hosts that
    /// fail to connect are dropped for this request only.
    pub(crate) async fn validate_target_hosts(
        &self,
        target_hosts: &[String],
    ) -> Result<Vec<LxdHost>, Status> {
        let mut configs = Vec::new();
        for target in target_hosts {
            match self.config.hosts.load(target) {
                Some(config) => configs.push(config),
                None => warn!(target = %target, "ignoring unknown target host"),
            }
        }
        if configs.is_empty() {
            return Err(Status::invalid_argument("valid target host is not found"));
        }

        let (hosts, errors) = connect_hosts(&configs).await;
        metrics::record_connect_errors(&errors);
        if hosts.is_empty() {
            return Err(Status::internal("no target host could be connected"));
        }

        Ok(hosts)
    }
}

#[tonic::async_trait]
impl Allocator for AllocatorService {
    async fn add_instance(
        &self,
        request: Request<AddInstanceRequest>,
    ) -> Result<Response<AddInstanceResponse>, Status> {
        let started = Instant::now();
        let result = self.handle_add_instance(request.into_inner()).await;
        let code = result.as_ref().err().map_or(tonic::Code::Ok, Status::code);
        metrics::record_grpc("AddInstance", code, started.elapsed());
        result.map(Response::new)
    }

    async fn delete_instance(
        &self,
        request: Request<DeleteInstanceRequest>,
    ) -> Result<Response<DeleteInstanceResponse>, Status> {
        let started = Instant::now();
        let result = self.handle_delete_instance(request.into_inner()).await;
        let code = result.as_ref().err().map_or(tonic::Code::Ok, Status::code);
        metrics::record_grpc("DeleteInstance", code, started.elapsed());
        result.map(Response::new)
    }
}
