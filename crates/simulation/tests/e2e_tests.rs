//! End-to-end committee scenarios on the deterministic runner.

use std::time::Duration;
use totem_simulation::{NetworkConfig, SimulationRunner};
use totem_types::{Hash, NodeConfig, ProcessId, Transaction, UnitDraft};
use tracing_test::traced_test;

fn fast_config() -> NodeConfig {
    NodeConfig {
        create_delay: Duration::from_millis(200),
        min_create_delay: Duration::from_millis(50),
        max_create_delay: Duration::from_secs(2),
        sync_delay: Duration::from_millis(100),
        ..NodeConfig::default()
    }
}

/// Neither order is allowed to diverge from the other on the shared
/// prefix.
fn assert_common_prefix(a: &[Hash], b: &[Hash]) {
    let shared = a.len().min(b.len());
    assert_eq!(&a[..shared], &b[..shared], "orders diverge within the common prefix");
}

#[test]
#[traced_test]
fn healthy_committee_orders_transactions() {
    let mut sim = SimulationRunner::new(4, fast_config(), NetworkConfig::default(), 11);
    sim.start();
    for node in 0..4 {
        sim.submit_transaction(node, Transaction::new(vec![0xaa, node as u8]));
    }
    sim.run_until(Duration::from_secs(30));

    for node in 0..4u16 {
        assert!(
            sim.node(node).ordering().timing_levels() >= 1,
            "node {node} elected no timing unit"
        );
        assert!(sim.node(node).ordering().ordered_len() > 0);
    }

    // Total order: all pairs agree on the shared prefix.
    let orders: Vec<Vec<Hash>> = (0..4).map(|n| sim.ordered_hashes(n)).collect();
    for a in 0..4 {
        for b in a + 1..4 {
            assert_common_prefix(&orders[a], &orders[b]);
        }
    }

    // The submitted transactions were committed somewhere in the order.
    let committed: Vec<Transaction> = sim
        .orders(0)
        .iter()
        .flat_map(|batch| batch.units.iter())
        .flat_map(|unit| unit.txs.iter().cloned())
        .collect();
    for node in 0..4 {
        assert!(
            committed.contains(&Transaction::new(vec![0xaa, node as u8])),
            "transaction from node {node} never ordered"
        );
    }
}

#[test]
fn committee_survives_silent_process() {
    let mut sim = SimulationRunner::new(4, fast_config(), NetworkConfig::default(), 23);
    // Process 0 never participates.
    for node in 1..4 {
        sim.start_node(node);
    }
    sim.run_until(Duration::from_secs(40));

    for node in 1..4u16 {
        let ordering = sim.node(node).ordering();
        assert!(ordering.poset().level_reached() >= 2);
        assert!(
            ordering.timing_levels() >= 1,
            "node {node} made no timing decision without process 0"
        );
    }
    let orders: Vec<Vec<Hash>> = (1..4).map(|n| sim.ordered_hashes(n)).collect();
    for a in 0..3 {
        for b in a + 1..3 {
            assert_common_prefix(&orders[a], &orders[b]);
        }
    }
}

#[test]
fn fork_is_detected_and_isolated() {
    let mut sim = SimulationRunner::new(4, fast_config(), NetworkConfig::default(), 37);
    sim.start();
    sim.run_until(Duration::from_secs(3));

    // Two conflicting units signed by process 2 at the same height,
    // both extending its dealing unit with different payloads.
    let dealing_hash = {
        let poset = sim.node(2).ordering().poset();
        let id = poset.dealing_units(ProcessId(2))[0];
        poset.hash(id)
    };
    let key = sim.key(2).clone();
    let fork_a = UnitDraft {
        creator: ProcessId(2),
        height: 1,
        parents: vec![dealing_hash],
        txs: vec![Transaction::new(b"left branch".to_vec())],
        coin_payload: vec![],
    }
    .sign(&key);
    let fork_b = UnitDraft {
        creator: ProcessId(2),
        height: 1,
        parents: vec![dealing_hash],
        txs: vec![Transaction::new(b"right branch".to_vec())],
        coin_payload: vec![],
    }
    .sign(&key);

    for node in 0..4 {
        sim.inject_unit(node, fork_a.clone(), ProcessId(2));
        sim.inject_unit(node, fork_b.clone(), ProcessId(2));
    }
    sim.run_until(Duration::from_secs(30));

    for node in 0..4u16 {
        let poset = sim.node(node).ordering().poset();
        assert!(poset.is_forker(ProcessId(2)), "node {node} missed the fork");
        assert_eq!(poset.forkers(), vec![ProcessId(2)]);
        assert_eq!(poset.forking_height(ProcessId(2)), Some(1));
    }

    // Consensus keeps going with the forker isolated.
    for node in [0u16, 1, 3] {
        assert!(sim.node(node).ordering().timing_levels() >= 1);
    }
    assert_common_prefix(&sim.ordered_hashes(0), &sim.ordered_hashes(1));
}

#[test]
fn parent_cap_is_respected() {
    let config = NodeConfig {
        max_parents: 2,
        ..fast_config()
    };
    let mut sim = SimulationRunner::new(7, config, NetworkConfig::default(), 41);
    sim.start();
    sim.run_until(Duration::from_secs(20));

    for node in 0..7u16 {
        let poset = sim.node(node).ordering().poset();
        for id in poset.ids() {
            assert!(
                poset.parents(id).len() <= 2,
                "unit with {} parents under a cap of 2",
                poset.parents(id).len()
            );
        }
        assert!(poset.level_reached() >= 1, "no level progress under the cap");
    }
}

#[test]
fn late_joiner_catches_up() {
    let mut sim = SimulationRunner::new(4, fast_config(), NetworkConfig::default(), 53);
    for node in 0..3 {
        sim.start_node(node);
    }
    sim.run_until(Duration::from_secs(10));
    sim.start_node(3);
    sim.run_until(Duration::from_secs(45));

    let late = sim.node(3).ordering();
    assert!(late.ordered_len() > 0, "late joiner ordered nothing");
    assert!(
        late.poset().len() > 20,
        "late joiner only holds {} units",
        late.poset().len()
    );
    assert_common_prefix(&sim.ordered_hashes(3), &sim.ordered_hashes(0));
    assert_common_prefix(&sim.ordered_hashes(3), &sim.ordered_hashes(1));
}

#[test]
fn replayed_units_are_a_no_op() {
    // Idle committee: only dealing units exist, nothing else happens.
    let idle = NodeConfig {
        create_delay: Duration::from_secs(1000),
        min_create_delay: Duration::from_secs(1000),
        max_create_delay: Duration::from_secs(2000),
        sync_delay: Duration::from_secs(1000),
        ..NodeConfig::default()
    };
    let mut sim = SimulationRunner::new(4, idle, NetworkConfig::default(), 61);
    sim.start();
    sim.run_until(Duration::from_secs(2));

    let before = sim.node(0).ordering().poset().len();
    assert_eq!(before, 4, "expected exactly the four dealing units");

    // Replay process 1's dealing unit at process 0.
    let replay = {
        let poset = sim.node(0).ordering().poset();
        let id = poset.dealing_units(ProcessId(1))[0];
        poset.unit(id).clone()
    };
    sim.inject_unit(0, replay, ProcessId(1));
    sim.run_until(Duration::from_secs(4));

    assert_eq!(sim.node(0).ordering().poset().len(), before);
    assert_eq!(sim.stats().misbehavior_reports, 0);
}

#[test]
fn partitioned_halves_reconcile_after_heal() {
    let mut sim = SimulationRunner::new(4, fast_config(), NetworkConfig::default(), 71);
    sim.start();
    // {0,1} vs {2,3}: neither half can reach the 2/3 quorum.
    for a in [0u16, 1] {
        for b in [2u16, 3] {
            sim.network_mut().partition(a, b);
        }
    }
    sim.run_until(Duration::from_secs(10));
    let stalled = sim.node(0).ordering().timing_levels();
    assert_eq!(stalled, 0, "a half-partition must not decide timing");

    sim.network_mut().heal_all();
    sim.run_until(Duration::from_secs(40));

    for node in 0..4u16 {
        assert!(
            sim.node(node).ordering().timing_levels() >= 1,
            "node {node} did not recover after heal"
        );
    }
    let orders: Vec<Vec<Hash>> = (0..4).map(|n| sim.ordered_hashes(n)).collect();
    for a in 0..4 {
        for b in a + 1..4 {
            assert_common_prefix(&orders[a], &orders[b]);
        }
    }
    assert!(sim.stats().dropped_partition > 0);
}
