//! DeleteInstance: tear down a bound container when its job finishes.

use std::time::Duration;

use futures_util::future::join_all;
use tonic::Status;
use tracing::{info, warn};

use frost_lxd::{LxdError, LxdHost, StateAction};
use frost_proto::allocator::v1::{DeleteInstanceRequest, DeleteInstanceResponse};

use crate::server::AllocatorService;

/// Deadline for probing one host for the instance.
const PROBE_DEADLINE: Duration = Duration::from_secs(2);

impl AllocatorService {
    pub(crate) async fn handle_delete_instance(
        &self,
        req: DeleteInstanceRequest,
    ) -> Result<DeleteInstanceResponse, Status> {
        info!(cloud_id = %req.cloud_id, "DeleteInstance");

        if req.cloud_id.is_empty() {
            return Err(Status::invalid_argument("cloud id is empty"));
        }
        let instance_name = req.cloud_id.as_str();

        let targets = self.validate_target_hosts(&req.target_hosts).await?;
        let host = find_holding_host(&targets, instance_name)
            .await
            .ok_or_else(|| {
                Status::not_found(format!("no host holds an instance named {instance_name:?}"))
            })?;

        info!(host = %host.config.host, instance = %instance_name, "stopping instance");
        match host.client.set_state(instance_name, StateAction::Stop).await {
            Ok(()) => {}
            Err(e) if e.is_already_stopped() => {}
            Err(e) => {
                return Err(Status::internal(format!("stop instance: {e}")));
            }
        }

        info!(host = %host.config.host, instance = %instance_name, "deleting instance");
        host.client
            .delete_instance(instance_name)
            .await
            .map_err(|e| Status::internal(format!("delete instance: {e}")))?;

        info!(host = %host.config.host, instance = %instance_name, "DeleteInstance succeeded");
        Ok(DeleteInstanceResponse {})
    }
}

/// Probe every target for the instance. Hosts that answer "not found" are
/// skipped; hosts that time out or error are treated as unknown and
/// skipped as well.
pub async fn find_holding_host(targets: &[LxdHost], instance_name: &str) -> Option<LxdHost> {
    let probes = join_all(targets.iter().map(|host| async move {
        match tokio::time::timeout(
            PROBE_DEADLINE,
            host.client.get_instance(instance_name),
        )
        .await
        {
            Ok(Ok(_)) => Some(host.clone()),
            Ok(Err(LxdError::NotFound)) => None,
            Ok(Err(e)) => {
                warn!(host = %host.config.host, error = %e, "probe failed, skipping host");
                None
            }
            Err(_) => {
                warn!(host = %host.config.host, "probe timed out, skipping host");
                None
            }
        }
    }))
    .await;

    probes.into_iter().flatten().next()
}
