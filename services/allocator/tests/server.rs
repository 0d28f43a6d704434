//! Validation tests for the gRPC surface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tonic::Request;

use frost_allocator::config::Config;
use frost_allocator::server::AllocatorService;
use frost_lxd::HostConfigMap;
use frost_proto::allocator::v1::{
    AddInstanceRequest, Allocator, DeleteInstanceRequest, ResourceType,
};
use frost_store::{Memory, Store};

fn test_service() -> AllocatorService {
    let config = Config {
        hosts: Arc::new(HostConfigMap::new()),
        resource_mapping: HashMap::new(),
        image_alias_map: HashMap::from([("focal".to_string(), "ubuntu:focal".to_string())]),
        cache_period: Duration::from_secs(10),
        listen_port: 8080,
        metrics_port: 9090,
        over_commit_percent: 100,
        log_level: "info".to_string(),
        cluster_enable: false,
        redis_hosts: Vec::new(),
        scheduler_url: None,
        rebind_requires_frozen: true,
    };
    let store: Arc<dyn Store> = Arc::new(Memory::new());
    AllocatorService::new(Arc::new(config), store)
}

#[tokio::test]
async fn test_add_instance_rejects_non_uuid_runner() {
    let service = test_service();
    let status = service
        .add_instance(Request::new(AddInstanceRequest {
            runner_name: "not-a-uuid".to_string(),
            setup_script: b"#!/bin/sh\ntrue\n".to_vec(),
            resource_type: ResourceType::Large as i32,
            target_hosts: vec!["https://10.0.0.1:8443".to_string()],
            os_version: "focal".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn test_add_instance_rejects_unknown_targets() {
    let service = test_service();
    let status = service
        .add_instance(Request::new(AddInstanceRequest {
            runner_name: "11111111-1111-1111-1111-111111111111".to_string(),
            setup_script: Vec::new(),
            resource_type: ResourceType::Large as i32,
            target_hosts: vec!["https://unknown:8443".to_string()],
            os_version: "focal".to_string(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn test_add_instance_rejects_empty_targets() {
    let service = test_service();
    let status = service
        .add_instance(Request::new(AddInstanceRequest {
            runner_name: "11111111-1111-1111-1111-111111111111".to_string(),
            setup_script: Vec::new(),
            resource_type: ResourceType::Large as i32,
            target_hosts: Vec::new(),
            os_version: String::new(),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn test_delete_instance_rejects_empty_cloud_id() {
    let service = test_service();
    let status = service
        .delete_instance(Request::new(DeleteInstanceRequest {
            cloud_id: String::new(),
            target_hosts: vec!["https://10.0.0.1:8443".to_string()],
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
}
