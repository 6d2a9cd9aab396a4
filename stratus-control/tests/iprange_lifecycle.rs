//! IpRange reconciliation against the simulated provider.

mod common;

use std::time::Duration;

use common::{CIDR, PROJECT, TestCluster, error_reason, is_ready, network_path};
use stratus_api::{IpRangePurpose, IpRangeSpec, Phase, RecordStore, reason};
use stratus_control::ProviderError;
use stratus_control::composed::Flow;
use stratus_control::controller::Reconciler;
use stratus_control::provider::{Address, AddressPurpose};

fn make_address(name: &str, network: &str) -> Address {
    Address {
        name: name.into(),
        address: "10.20.30.0".into(),
        prefix_length: 24,
        network: network.into(),
        purpose: AddressPurpose::VpcPeering,
    }
}

#[tokio::test]
async fn test_create_reserves_address_then_peering() {
    let cluster = TestCluster::new();
    let created = cluster.create_ip_range("r1", IpRangeSpec::new(CIDR)).await;
    let address_name = created.canonical_address_name();

    let flow = cluster.drive_ip_range("r1").await;
    assert_eq!(flow, Flow::Forget);

    let range = cluster.ip_range("r1").await.unwrap();
    assert_eq!(range.status.phase, Phase::Ready);
    assert!(is_ready(&range.status.conditions));
    assert_eq!(range.status.cidr, CIDR);
    assert_eq!(range.status.address_name, address_name);
    assert_eq!(range.status.ip_address, "10.20.30.0");
    assert_eq!(range.status.prefix, 24);
    assert!(range.status.operation.is_none());

    assert_eq!(
        cluster.mutation_methods(),
        vec!["insert_address", "create_connection"]
    );
    let connection = cluster.sim.connection(PROJECT, &network_path()).unwrap();
    assert_eq!(connection.reserved_peering_ranges, vec![address_name]);
}

#[tokio::test]
async fn test_psc_range_has_no_peering() {
    let cluster = TestCluster::new();
    let mut spec = IpRangeSpec::new(CIDR);
    spec.purpose = IpRangePurpose::Psc;
    let created = cluster.create_ip_range("r1", spec).await;

    cluster.drive_ip_range("r1").await;

    let range = cluster.ip_range("r1").await.unwrap();
    assert_eq!(range.status.phase, Phase::Ready);
    assert_eq!(cluster.mutation_methods(), vec!["insert_address"]);
    let address = cluster
        .sim
        .address(PROJECT, &created.canonical_address_name())
        .unwrap();
    assert_eq!(address.purpose, AddressPurpose::PrivateServiceConnect);
    assert!(cluster.sim.connection(PROJECT, &network_path()).is_none());
}

#[tokio::test]
async fn test_converged_range_dispatches_nothing() {
    let cluster = TestCluster::new();
    cluster.ready_ip_range("r1", CIDR).await;
    let before = cluster.ip_range("r1").await.unwrap();
    cluster.sim.clear_mutations();

    for _ in 0..3 {
        let flow = cluster.ip_range_reconciler.reconcile("r1").await.unwrap();
        assert_eq!(flow, Flow::Forget);
    }

    assert!(cluster.sim.mutations().is_empty());
    let after = cluster.ip_range("r1").await.unwrap();
    assert_eq!(after.meta.resource_version, before.meta.resource_version);
}

#[tokio::test]
async fn test_at_most_one_operation_in_flight() {
    let cluster = TestCluster::new();
    cluster.create_ip_range("r1", IpRangeSpec::new(CIDR)).await;

    let mut handles = Vec::new();
    loop {
        let flow = cluster.ip_range_reconciler.reconcile("r1").await.unwrap();
        assert!(cluster.sim.pending_operations() <= 1);
        let range = cluster.ip_range("r1").await.unwrap();
        if let Some(op) = range.status.operation
            && handles.last() != Some(&op.id)
        {
            handles.push(op.id);
        }
        if flow == Flow::Forget {
            break;
        }
    }

    // One handle per mutation, each cleared before the next was dispatched.
    assert_eq!(handles.len(), cluster.sim.mutations().len());
    assert_eq!(handles.len(), 2);
}

#[tokio::test]
async fn test_cidr_change_is_rejected_without_provider_calls() {
    let cluster = TestCluster::new();
    cluster.ready_ip_range("r1", CIDR).await;
    cluster.sim.clear_mutations();

    cluster
        .ip_ranges
        .update_spec("r1", IpRangeSpec::new("10.20.31.0/24"))
        .await
        .unwrap();
    let flow = cluster.ip_range_reconciler.reconcile("r1").await.unwrap();
    assert_eq!(flow, Flow::Forget);

    let range = cluster.ip_range("r1").await.unwrap();
    assert_eq!(range.status.phase, Phase::Error);
    assert_eq!(
        error_reason(&range.status.conditions).as_deref(),
        Some(reason::CIDR_CAN_NOT_BE_CHANGED)
    );
    assert_eq!(range.status.cidr, CIDR);

    // Still rejected on the next pass even though the phase is no longer Ready.
    let flow = cluster.ip_range_reconciler.reconcile("r1").await.unwrap();
    assert_eq!(flow, Flow::Forget);
    assert!(cluster.sim.mutations().is_empty());

    // Setting the cidr back recovers without touching the provider.
    cluster
        .ip_ranges
        .update_spec("r1", IpRangeSpec::new(CIDR))
        .await
        .unwrap();
    cluster.drive_ip_range("r1").await;
    let range = cluster.ip_range("r1").await.unwrap();
    assert_eq!(range.status.phase, Phase::Ready);
    assert!(error_reason(&range.status.conditions).is_none());
    assert!(cluster.sim.mutations().is_empty());
}

#[tokio::test]
async fn test_legacy_address_outside_network_is_ignored() {
    let cluster = TestCluster::new();
    cluster.sim.put_address(
        PROJECT,
        make_address("legacy-range", "projects/p1/global/networks/other"),
    );
    let mut spec = IpRangeSpec::new(CIDR);
    spec.remote_ref.name = "legacy-range".into();
    let created = cluster.create_ip_range("r1", spec).await;

    let flow = cluster.ip_range_reconciler.reconcile("r1").await.unwrap();
    assert!(matches!(flow, Flow::RequeueAfter(_)));
    let range = cluster.ip_range("r1").await.unwrap();
    assert!(error_reason(&range.status.conditions).is_none());

    let calls = cluster.sim.mutations();
    assert_eq!(calls[0].method, "insert_address");
    assert_eq!(calls[0].target, created.canonical_address_name());

    cluster.drive_ip_range("r1").await;
    let range = cluster.ip_range("r1").await.unwrap();
    assert_eq!(range.status.address_name, created.canonical_address_name());
    assert!(cluster.sim.address(PROJECT, "legacy-range").is_some());
}

#[tokio::test]
async fn test_legacy_address_in_network_is_adopted() {
    let cluster = TestCluster::new();
    cluster
        .sim
        .put_address(PROJECT, make_address("legacy-range", &network_path()));
    let mut spec = IpRangeSpec::new(CIDR);
    spec.remote_ref.name = "legacy-range".into();
    cluster.create_ip_range("r1", spec).await;

    cluster.drive_ip_range("r1").await;

    let range = cluster.ip_range("r1").await.unwrap();
    assert_eq!(range.status.phase, Phase::Ready);
    assert_eq!(range.status.address_name, "legacy-range");
    assert_eq!(cluster.mutation_methods(), vec!["create_connection"]);
    let connection = cluster.sim.connection(PROJECT, &network_path()).unwrap();
    assert_eq!(connection.reserved_peering_ranges, vec!["legacy-range"]);
}

#[tokio::test]
async fn test_canonical_address_in_wrong_network_is_terminal() {
    let cluster = TestCluster::new();
    let created = cluster.create_ip_range("r1", IpRangeSpec::new(CIDR)).await;
    cluster.sim.put_address(
        PROJECT,
        make_address(
            &created.canonical_address_name(),
            "projects/p1/global/networks/other",
        ),
    );

    let flow = cluster.ip_range_reconciler.reconcile("r1").await.unwrap();
    assert_eq!(flow, Flow::Forget);

    let range = cluster.ip_range("r1").await.unwrap();
    assert_eq!(
        error_reason(&range.status.conditions).as_deref(),
        Some(reason::WRONG_NETWORK)
    );
    assert!(cluster.sim.mutations().is_empty());
}

#[tokio::test]
async fn test_mismatched_address_is_not_modified() {
    let cluster = TestCluster::new();
    let created = cluster
        .create_ip_range("r1", IpRangeSpec::new("10.20.40.0/24"))
        .await;
    cluster.sim.put_address(
        PROJECT,
        make_address(&created.canonical_address_name(), &network_path()),
    );

    let flow = cluster.ip_range_reconciler.reconcile("r1").await.unwrap();
    assert_eq!(flow, Flow::Forget);

    let range = cluster.ip_range("r1").await.unwrap();
    assert_eq!(
        error_reason(&range.status.conditions).as_deref(),
        Some(reason::ADDRESS_MISMATCH)
    );
    assert!(cluster.sim.mutations().is_empty());
}

#[tokio::test]
async fn test_failed_operation_is_surfaced_then_retried() {
    let cluster = TestCluster::new();
    cluster.sim.fail_next_operation("quota exceeded");
    cluster.create_ip_range("r1", IpRangeSpec::new(CIDR)).await;

    // Dispatch, running, failed.
    let reconciler = &cluster.ip_range_reconciler;
    assert!(matches!(reconciler.reconcile("r1").await.unwrap(), Flow::RequeueAfter(_)));
    assert!(matches!(reconciler.reconcile("r1").await.unwrap(), Flow::RequeueAfter(_)));
    assert_eq!(reconciler.reconcile("r1").await.unwrap(), Flow::Requeue);

    let range = cluster.ip_range("r1").await.unwrap();
    assert_eq!(range.status.phase, Phase::Error);
    assert!(range.status.operation.is_none());
    assert_eq!(
        error_reason(&range.status.conditions).as_deref(),
        Some(reason::PROVIDER_ERROR)
    );
    let condition = &range.status.conditions[0];
    assert!(condition.message.contains("quota exceeded"));

    cluster.drive_ip_range("r1").await;
    let range = cluster.ip_range("r1").await.unwrap();
    assert_eq!(range.status.phase, Phase::Ready);
    assert!(error_reason(&range.status.conditions).is_none());
    assert_eq!(
        cluster.mutation_methods(),
        vec!["insert_address", "insert_address", "create_connection"]
    );
}

#[tokio::test]
async fn test_rejected_address_insert_is_retried() {
    let cluster = TestCluster::new();
    let created = cluster.create_ip_range("r1", IpRangeSpec::new(CIDR)).await;
    cluster
        .sim
        .fail_next_call("insert_address", ProviderError::api(503, "backend unavailable"));

    let flow = cluster.ip_range_reconciler.reconcile("r1").await.unwrap();
    assert_eq!(flow, Flow::RequeueAfter(Duration::from_millis(10)));

    let range = cluster.ip_range("r1").await.unwrap();
    assert_eq!(range.status.phase, Phase::Error);
    assert!(range.status.operation.is_none());
    assert_eq!(
        error_reason(&range.status.conditions).as_deref(),
        Some(reason::PROVIDER_ERROR)
    );
    assert!(range.status.conditions[0].message.contains("backend unavailable"));
    assert!(cluster.sim.mutations().is_empty());
    assert!(
        cluster
            .sim
            .address(PROJECT, &created.canonical_address_name())
            .is_none()
    );

    assert_eq!(cluster.drive_ip_range("r1").await, Flow::Forget);
    let range = cluster.ip_range("r1").await.unwrap();
    assert_eq!(range.status.phase, Phase::Ready);
    assert!(error_reason(&range.status.conditions).is_none());
    assert_eq!(
        cluster.mutation_methods(),
        vec!["insert_address", "create_connection"]
    );
}

#[tokio::test]
async fn test_rejected_peering_create_is_retried() {
    let cluster = TestCluster::new();
    cluster.create_ip_range("r1", IpRangeSpec::new(CIDR)).await;
    cluster
        .sim
        .fail_next_call("create_connection", ProviderError::api(429, "rate limited"));

    let mut failed = false;
    for _ in 0..10 {
        let flow = cluster.ip_range_reconciler.reconcile("r1").await.unwrap();
        let range = cluster.ip_range("r1").await.unwrap();
        if error_reason(&range.status.conditions).as_deref() == Some(reason::PROVIDER_ERROR) {
            assert_eq!(flow, Flow::RequeueAfter(Duration::from_millis(10)));
            assert_eq!(range.status.phase, Phase::Error);
            assert!(range.status.operation.is_none());
            failed = true;
            break;
        }
    }
    assert!(failed, "connection failure was not surfaced");
    assert_eq!(cluster.mutation_methods(), vec!["insert_address"]);
    assert!(cluster.sim.connection(PROJECT, &network_path()).is_none());

    assert_eq!(cluster.drive_ip_range("r1").await, Flow::Forget);
    let range = cluster.ip_range("r1").await.unwrap();
    assert!(is_ready(&range.status.conditions));
    assert_eq!(
        cluster.mutation_methods(),
        vec!["insert_address", "create_connection"]
    );
}

#[tokio::test]
async fn test_delete_releases_peering_before_address() {
    let cluster = TestCluster::new();
    let range = cluster.ready_ip_range("r1", CIDR).await;
    cluster.sim.clear_mutations();

    cluster.ip_ranges.request_delete("r1").await.unwrap();
    let flow = cluster.drive_ip_range("r1").await;
    assert_eq!(flow, Flow::Forget);

    assert!(cluster.ip_range("r1").await.is_none());
    assert_eq!(
        cluster.mutation_methods(),
        vec!["delete_connection", "delete_address"]
    );
    assert!(cluster.sim.connection(PROJECT, &network_path()).is_none());
    assert!(
        cluster
            .sim
            .address(PROJECT, &range.status.address_name)
            .is_none()
    );
}

#[tokio::test]
async fn test_delete_keeps_other_peering_ranges() {
    let cluster = TestCluster::new();
    let first = cluster.ready_ip_range("r1", CIDR).await;
    let second = cluster.ready_ip_range("r2", "10.20.31.0/24").await;

    let mut both = vec![
        first.status.address_name.clone(),
        second.status.address_name.clone(),
    ];
    both.sort();
    let connection = cluster.sim.connection(PROJECT, &network_path()).unwrap();
    assert_eq!(connection.reserved_peering_ranges, both);
    cluster.sim.clear_mutations();

    cluster.ip_ranges.request_delete("r1").await.unwrap();
    cluster.drive_ip_range("r1").await;

    let calls = cluster.sim.mutations();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].method, "patch_connection");
    assert_eq!(calls[0].target, second.status.address_name);
    assert_eq!(calls[1].method, "delete_address");
    assert_eq!(calls[1].target, first.status.address_name);

    let connection = cluster.sim.connection(PROJECT, &network_path()).unwrap();
    assert_eq!(
        connection.reserved_peering_ranges,
        vec![second.status.address_name.clone()]
    );
    assert!(
        cluster
            .sim
            .address(PROJECT, &second.status.address_name)
            .is_some()
    );
    assert!(cluster.ip_range("r1").await.is_none());
    assert!(cluster.ip_range("r2").await.is_some());
}

#[tokio::test]
async fn test_delete_of_invalid_range_releases_record() {
    let cluster = TestCluster::new();
    cluster
        .create_ip_range("r1", IpRangeSpec::new("not-a-cidr"))
        .await;
    cluster.ip_range_reconciler.reconcile("r1").await.unwrap();

    // No finalizer was added, so the record goes away right away.
    cluster.ip_ranges.request_delete("r1").await.unwrap();
    assert!(cluster.ip_range("r1").await.is_none());
    assert!(cluster.sim.mutations().is_empty());
}
