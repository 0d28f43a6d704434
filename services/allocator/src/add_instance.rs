//! AddInstance: bind a pooled container to a runner job.

use std::time::Duration;

use tonic::Status;
use tracing::{error, info, warn};
use uuid::Uuid;

use frost_lxd::{InstanceStatus, LxdHost, StateAction};
use frost_proto::allocator::v1::{AddInstanceRequest, AddInstanceResponse, ResourceType};

use crate::config::resource_type_name;
use crate::pool::{self, Candidate};
use crate::scheduler_client::ScheduleRequest;
use crate::server::AllocatorService;

/// How many claim passes to run before declaring the pool exhausted.
const CLAIM_ATTEMPTS: usize = 10;
/// Pause between claim passes, giving the pool agents time to refill.
const CLAIM_RETRY_DELAY: Duration = Duration::from_secs(1);

impl AllocatorService {
    pub(crate) async fn handle_add_instance(
        &self,
        req: AddInstanceRequest,
    ) -> Result<AddInstanceResponse, Status> {
        info!(runner = %req.runner_name, os_version = %req.os_version, "AddInstance");

        if Uuid::parse_str(&req.runner_name).is_err() {
            return Err(Status::invalid_argument(format!(
                "failed to parse runner name {:?}",
                req.runner_name
            )));
        }

        let targets = self.validate_target_hosts(&req.target_hosts).await?;
        let resource_type =
            ResourceType::try_from(req.resource_type).unwrap_or(ResourceType::Unknown);
        let image_alias = self.config.resolve_image_alias(&req.os_version);

        let candidate = self
            .find_or_claim(&targets, resource_type, &image_alias, &req.runner_name)
            .await?;

        self.thaw_and_setup(
            &candidate.host,
            &candidate.instance_name,
            &req.runner_name,
            &req.setup_script,
        )
        .await?;

        // Re-read before answering so the response reflects the host's view.
        let (instance, _) = candidate
            .host
            .client
            .get_instance(&candidate.instance_name)
            .await
            .map_err(|e| {
                Status::internal(format!("failed to retrieve instance information: {e}"))
            })?;

        info!(
            host = %candidate.host.config.host,
            instance = %instance.name,
            "AddInstance succeeded"
        );

        Ok(AddInstanceResponse {
            cloud_id: instance.name,
            shoes_type: "lxd".to_string(),
            ip_address: String::new(),
            resource_type: req.resource_type,
        })
    }

    /// Either re-find an instance already bound to this runner, or run the
    /// claim loop until one is won.
    async fn find_or_claim(
        &self,
        targets: &[LxdHost],
        resource_type: ResourceType,
        image_alias: &str,
        runner_name: &str,
    ) -> Result<Candidate, Status> {
        if let Some(existing) = pool::find_instance_by_job(
            &self.cache,
            targets,
            runner_name,
            self.config.rebind_requires_frozen,
        )
        .await
        {
            info!(
                host = %existing.host.config.host,
                instance = %existing.instance_name,
                "reusing instance already bound to this runner"
            );
            return Ok(existing);
        }

        let type_name = resource_type_name(resource_type);
        for attempt in 1..=CLAIM_ATTEMPTS {
            let narrowed = self.narrow_targets(targets, resource_type).await;
            match pool::allocate_pooled_instance(
                &self.cache,
                &narrowed,
                type_name,
                image_alias,
                self.config.over_commit_percent,
                runner_name,
            )
            .await
            {
                Ok(candidate) => return Ok(candidate),
                Err(e) => {
                    info!(attempt, error = %e, "failed to allocate pooled instance, retrying");
                    if attempt < CLAIM_ATTEMPTS {
                        tokio::time::sleep(CLAIM_RETRY_DELAY).await;
                    }
                }
            }
        }

        Err(Status::internal("can not allocate instance"))
    }

    /// Ask the placement service for a preferred host, narrowing the
    /// candidate set on success. Any failure falls back to all targets.
    async fn narrow_targets(
        &self,
        targets: &[LxdHost],
        resource_type: ResourceType,
    ) -> Vec<LxdHost> {
        let Some(scheduler) = &self.scheduler else {
            return targets.to_vec();
        };

        let (cpu, memory) = match self.config.resource_requirements(resource_type) {
            Ok(requirements) => requirements,
            Err(e) => {
                warn!(error = %e, "failed to resolve resource requirements, using all targets");
                return targets.to_vec();
            }
        };

        let request = ScheduleRequest {
            cpu,
            memory,
            target_hosts: targets.iter().map(|h| h.config.host.clone()).collect(),
        };
        match scheduler.schedule(&request).await {
            Ok(response) => {
                if let Some(selected) = targets
                    .iter()
                    .find(|h| h.config.host == response.host)
                {
                    info!(host = %response.host, cpu, memory, "scheduler selected host");
                    return vec![selected.clone()];
                }
                warn!(host = %response.host, "scheduler selected a host outside the targets");
                targets.to_vec()
            }
            Err(e) => {
                warn!(error = %e, "scheduler failed, falling back to default algorithm");
                targets.to_vec()
            }
        }
    }

    /// Thaw the claimed instance, push the setup script, and run it under
    /// a transient systemd unit. Failures corrupt the instance, so it is
    /// deleted before reporting the error.
    async fn thaw_and_setup(
        &self,
        host: &LxdHost,
        instance_name: &str,
        runner_name: &str,
        setup_script: &[u8],
    ) -> Result<(), Status> {
        if let Err(e) = unfreeze_instance(host, instance_name).await {
            error!(instance = %instance_name, error = %e, "failed to unfreeze instance, deleting");
            recover_invalid_instance(host, instance_name).await;
            return Err(Status::internal(format!("unfreeze instance: {e}")));
        }

        let script_path = format!("/tmp/myshoes_setup_script.{}", rand::random::<u64>());
        if let Err(e) = host
            .client
            .push_file(instance_name, &script_path, setup_script, 0o744)
            .await
        {
            error!(instance = %instance_name, error = %e, "failed to push setup script, deleting");
            recover_invalid_instance(host, instance_name).await;
            return Err(Status::internal(format!("copy setup script: {e}")));
        }

        let command = vec![
            "systemd-run".to_string(),
            "--unit".to_string(),
            "myshoes-setup".to_string(),
            "--property".to_string(),
            "After=multi-user.target".to_string(),
            "--property".to_string(),
            "StandardOutput=journal+console".to_string(),
            // hostnamectl needs dbus, which does not answer under load
            "--property".to_string(),
            format!("ExecStartPre=/usr/bin/hostname {runner_name}"),
            "--property".to_string(),
            format!("ExecStartPre=/bin/sh -c 'echo 127.0.1.1 {runner_name} >> /etc/hosts'"),
            script_path,
        ];

        let exec = match host.client.exec(instance_name, &command).await {
            Ok(exec) => exec,
            Err(e) => {
                error!(instance = %instance_name, error = %e, "failed to execute setup script, deleting");
                recover_invalid_instance(host, instance_name).await;
                return Err(Status::internal(format!("execute setup script: {e}")));
            }
        };

        if exec.exit_code != 0 {
            error!(
                instance = %instance_name,
                exit_code = exec.exit_code,
                stdout = %exec.stdout,
                stderr = %exec.stderr,
                "setup script failed, deleting"
            );
            recover_invalid_instance(host, instance_name).await;
            return Err(Status::internal(format!(
                "setup script exited with code {}",
                exec.exit_code
            )));
        }

        Ok(())
    }
}

/// Bring a claimed instance out of the freezer. Running is fine as-is;
/// anything else is unexpected.
async fn unfreeze_instance(host: &LxdHost, instance_name: &str) -> Result<(), frost_lxd::LxdError> {
    let (instance, _) = host.client.get_instance(instance_name).await?;
    match instance.status {
        InstanceStatus::Running => Ok(()),
        InstanceStatus::Frozen => {
            host.client
                .set_state(instance_name, StateAction::Unfreeze)
                .await
        }
        other => Err(frost_lxd::LxdError::Invalid(format!(
            "unexpected instance state: {}",
            other.as_str()
        ))),
    }
}

/// Best-effort removal of an instance that failed mid-handoff. The zombie
/// sweeper catches anything this misses.
async fn recover_invalid_instance(host: &LxdHost, instance_name: &str) {
    if let Err(e) = host.client.delete_instance(instance_name).await {
        error!(instance = %instance_name, error = %e, "failed to delete invalid instance");
    }
}
