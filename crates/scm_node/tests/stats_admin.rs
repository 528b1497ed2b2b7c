//! Stats aggregation, pipeline/container bookkeeping, command fanout and
//! the management surface.

mod common;

use std::collections::HashSet;

use common::{disk_report, harness, harness_with, heartbeat, identity, register_ok, scm_layout};
use scm_node::{
    CommandForDatanode, CommandPayload, CommandType, ContainerId, NodeError, NodeHealth,
    NodeManagerConfig, NodeOperationalState, PipelineId, RegisterErrorCode, ScmCommand,
};
use uuid::Uuid;

#[test]
fn cluster_stat_skips_dead_nodes() {
    let h = harness();
    let dn1 = identity(1, "dn1", "10.0.0.1");
    let dn2 = identity(2, "dn2", "10.0.0.2");
    for (dn, capacity, used) in [(&dn1, 1_000, 100), (&dn2, 2_000, 400)] {
        let response =
            h.manager
                .register(dn.clone(), Some(&disk_report(capacity, used)), &[], scm_layout(), None);
        assert_eq!(response.error_code, RegisterErrorCode::Success);
    }

    let stat = h.manager.cluster_stat();
    assert_eq!(stat.capacity, 3_000);
    assert_eq!(stat.used, 500);

    // Age dn2 to death; its capacity drops out of the totals.
    h.clock.set(u64::from(u32::MAX));
    h.manager.process_heartbeat(&heartbeat(&dn1));
    h.manager.run_health_check();
    assert_eq!(h.manager.get_node(dn2.uuid).unwrap().health, NodeHealth::Dead);

    let stat = h.manager.cluster_stat();
    assert_eq!(stat.capacity, 1_000);
    assert!(h.manager.node_stats().get(&dn2.uuid).is_none());
    // Per-node stats still answer for dead nodes.
    assert!(h.manager.node_stat(dn2.uuid).is_some());
    assert!(h.manager.node_stat(Uuid::new_v4()).is_none());
}

#[test]
fn most_used_ordering_filters_to_healthy_in_service() {
    let h = harness();
    let busy = identity(1, "busy", "10.0.0.1");
    let idle = identity(2, "idle", "10.0.0.2");
    let draining = identity(3, "draining", "10.0.0.3");
    for (dn, used) in [(&busy, 900), (&idle, 100), (&draining, 500)] {
        let response =
            h.manager
                .register(dn.clone(), Some(&disk_report(1_000, used)), &[], scm_layout(), None);
        assert_eq!(response.error_code, RegisterErrorCode::Success);
    }
    h.manager
        .set_node_operational_state(draining.uuid, NodeOperationalState::Decommissioning, 0)
        .unwrap();

    let most = h.manager.most_or_least_used_datanodes(true);
    let ids: Vec<_> = most.iter().map(|i| i.identity.uuid).collect();
    assert_eq!(ids, vec![busy.uuid, idle.uuid]);

    let least = h.manager.most_or_least_used_datanodes(false);
    let ids: Vec<_> = least.iter().map(|i| i.identity.uuid).collect();
    assert_eq!(ids, vec![idle.uuid, busy.uuid]);
}

#[test]
fn pipeline_limit_derives_from_metadata_volumes() {
    let h = harness();
    let dn1 = identity(1, "dn1", "10.0.0.1");
    // Default report: one healthy disk, one metadata volume, and the
    // default config allows two pipelines per metadata volume.
    register_ok(&h, &dn1);
    assert_eq!(h.manager.pipeline_limit(dn1.uuid), 2);

    // No healthy volumes: no pipelines.
    let mut report = disk_report(1_000, 100);
    report.storage_reports[0].healthy = false;
    h.manager.process_node_report(&dn1, &report);
    assert_eq!(h.manager.pipeline_limit(dn1.uuid), 0);

    // Unknown nodes contribute zero.
    assert_eq!(h.manager.pipeline_limit(Uuid::new_v4()), 0);

    assert_eq!(h.manager.min_pipeline_limit(&[]), None);
    assert_eq!(h.manager.min_pipeline_limit(&[dn1.uuid]), Some(0));
}

#[test]
fn fixed_pipeline_limit_overrides_derivation() {
    let config = NodeManagerConfig {
        datanode_pipeline_limit: 5,
        ..NodeManagerConfig::default()
    };
    let h = harness_with(config, Box::new(|_| None));
    let dn1 = identity(1, "dn1", "10.0.0.1");
    register_ok(&h, &dn1);
    assert_eq!(h.manager.pipeline_limit(dn1.uuid), 5);
}

#[test]
fn min_healthy_volume_num_skips_unknown_nodes() {
    let h = harness();
    let dn1 = identity(1, "dn1", "10.0.0.1");
    register_ok(&h, &dn1);

    assert_eq!(h.manager.min_healthy_volume_num(&[]), None);
    assert_eq!(h.manager.min_healthy_volume_num(&[Uuid::new_v4()]), None);
    assert_eq!(
        h.manager.min_healthy_volume_num(&[dn1.uuid, Uuid::new_v4()]),
        Some(1)
    );
    assert_eq!(h.manager.total_healthy_volume_count(), 1);
}

#[test]
fn peer_list_unions_pipelines_and_drops_self() {
    let h = harness();
    let a = identity(1, "a", "10.0.0.1");
    let b = identity(2, "b", "10.0.0.2");
    let c = identity(3, "c", "10.0.0.3");
    let d = identity(4, "d", "10.0.0.4");
    for dn in [&a, &b, &c, &d] {
        register_ok(&h, dn);
    }

    let p1 = PipelineId(Uuid::from_u128(100));
    let p2 = PipelineId(Uuid::from_u128(200));
    let gone = PipelineId(Uuid::from_u128(300));
    h.pipelines.insert(p1, vec![a.uuid, b.uuid, c.uuid]);
    h.pipelines.insert(p2, vec![a.uuid, d.uuid]);
    h.manager.add_pipeline(p1, &[a.uuid, b.uuid, c.uuid]);
    h.manager.add_pipeline(p2, &[a.uuid, d.uuid]);
    // Membership recorded here but unknown to the pipeline manager:
    // ignored by peer-list computation.
    h.manager.add_pipeline(gone, &[a.uuid]);

    assert_eq!(h.manager.pipelines_count(a.uuid), 3);
    let peers = h.manager.peer_list(a.uuid).unwrap();
    assert_eq!(peers, HashSet::from([b.uuid, c.uuid, d.uuid]));

    h.manager.remove_pipeline(p2, &[a.uuid, d.uuid]);
    let peers = h.manager.peer_list(a.uuid).unwrap();
    assert_eq!(peers, HashSet::from([b.uuid, c.uuid]));

    assert!(matches!(
        h.manager.peer_list(Uuid::new_v4()),
        Err(NodeError::NodeNotFound(_))
    ));
}

#[test]
fn container_membership_round_trip() {
    let h = harness();
    let dn1 = identity(1, "dn1", "10.0.0.1");
    register_ok(&h, &dn1);

    h.manager.add_container(dn1.uuid, ContainerId(1)).unwrap();
    h.manager.add_container(dn1.uuid, ContainerId(2)).unwrap();
    assert_eq!(
        h.manager.containers(dn1.uuid).unwrap(),
        HashSet::from([ContainerId(1), ContainerId(2)])
    );

    h.manager.remove_container(dn1.uuid, ContainerId(2)).unwrap();
    assert_eq!(
        h.manager.containers(dn1.uuid).unwrap(),
        HashSet::from([ContainerId(1)])
    );

    h.manager
        .set_containers(dn1.uuid, HashSet::from([ContainerId(9)]))
        .unwrap();
    assert_eq!(h.manager.containers(dn1.uuid).unwrap(), HashSet::from([ContainerId(9)]));
    assert_eq!(h.manager.usage_info(dn1.uuid).unwrap().container_count, 1);

    assert!(matches!(
        h.manager.add_container(Uuid::new_v4(), ContainerId(1)),
        Err(NodeError::NodeNotFound(_))
    ));
}

#[test]
fn operational_state_round_trip() {
    let h = harness();
    let dn1 = identity(1, "dn1", "10.0.0.1");
    register_ok(&h, &dn1);

    h.manager
        .set_node_operational_state(dn1.uuid, NodeOperationalState::EnteringMaintenance, 12_345)
        .unwrap();
    let status = h.manager.get_node_status(dn1.uuid).unwrap();
    assert_eq!(status.operational_state, NodeOperationalState::EnteringMaintenance);
    assert_eq!(status.op_state_expiry_epoch_sec, 12_345);
    assert!(status.is_maintenance());

    assert!(matches!(
        h.manager
            .set_node_operational_state(Uuid::new_v4(), NodeOperationalState::InService, 0),
        Err(NodeError::NodeNotFound(_))
    ));
}

#[test]
fn refresh_usage_fanout_targets_healthy_in_service_nodes() {
    let h = harness();
    let healthy = identity(1, "dn1", "10.0.0.1");
    let draining = identity(2, "dn2", "10.0.0.2");
    register_ok(&h, &healthy);
    register_ok(&h, &draining);
    h.manager
        .set_node_operational_state(draining.uuid, NodeOperationalState::Decommissioning, 0)
        .unwrap();

    h.manager.refresh_all_healthy_dn_usage_info();
    assert_eq!(
        h.manager
            .command_queue_count(healthy.uuid, CommandType::RefreshVolumeUsage),
        1
    );
    assert_eq!(
        h.manager
            .command_queue_count(draining.uuid, CommandType::RefreshVolumeUsage),
        0
    );

    // A non-leader drops the fanout entirely.
    h.manager.drain_command_queue(healthy.uuid);
    h.context.set_leader(false);
    h.manager.refresh_all_healthy_dn_usage_info();
    assert_eq!(
        h.manager
            .command_queue_count(healthy.uuid, CommandType::RefreshVolumeUsage),
        0
    );
}

#[tokio::test]
async fn command_feed_lands_in_the_outbox() {
    let h = harness();
    let dn1 = identity(1, "dn1", "10.0.0.1");
    register_ok(&h, &dn1);

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let subscriber = h.manager.spawn_command_subscriber(rx);
    tx.send(CommandForDatanode {
        datanode: dn1.uuid,
        command: ScmCommand::new(CommandPayload::RefreshVolumeUsage),
    })
    .unwrap();
    drop(tx);
    subscriber.await.unwrap();

    assert_eq!(
        h.manager
            .command_queue_count(dn1.uuid, CommandType::RefreshVolumeUsage),
        1
    );
}

#[test]
fn management_views_cover_every_state_combination() {
    let h = harness();
    let mut dn1 = identity(1, "dn1", "10.0.0.1");
    dn1.http_port = Some(9880);
    dn1.https_port = Some(9889);
    let response = h
        .manager
        .register(dn1.clone(), Some(&disk_report(1_000, 100)), &[], scm_layout(), None);
    assert_eq!(response.error_code, RegisterErrorCode::Success);
    let dn2 = identity(2, "dn2", "10.0.0.2");
    register_ok(&h, &dn2);
    h.manager
        .set_node_operational_state(dn2.uuid, NodeOperationalState::InMaintenance, 0)
        .unwrap();

    let counts = h.manager.node_count_by_state();
    assert_eq!(counts["IN_SERVICE"]["HEALTHY"], 1);
    assert_eq!(counts["IN_MAINTENANCE"]["HEALTHY"], 1);
    assert_eq!(counts["DECOMMISSIONED"]["DEAD"], 0);
    assert_eq!(counts.len(), NodeOperationalState::ALL.len());

    let info = h.manager.node_info();
    assert_eq!(info["DiskCapacity"], 1_000);
    assert_eq!(info["MaintenanceDiskCapacity"], 1_000);
    assert_eq!(info["DecommissionedDiskCapacity"], 0);

    let statuses = h.manager.node_status_info();
    let row = &statuses["dn1"];
    assert_eq!(row.operational_state, "IN_SERVICE");
    assert_eq!(row.health, "HEALTHY");
    assert_eq!(row.http_port, Some(9880));
    assert_eq!(row.https_port, Some(9889));
    assert_eq!(statuses["dn2"].operational_state, "IN_MAINTENANCE");

    let json = h.manager.nodes_json().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.as_array().unwrap().len(), 2);
    assert!(json.contains("dn1"));
}
