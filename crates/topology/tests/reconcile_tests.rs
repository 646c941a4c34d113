//! Reconciliation Integration Tests
//!
//! Drives `DeviceManager::scan()` against a scripted mock bus.
//!
//! # Test Scenarios
//! - Hub / child attach and detach across scan cycles
//! - Resident set tracking the identified devices of each snapshot
//! - Address reuse within one cycle
//! - Enumeration failures leaving the topology untouched
//! - `first_scan()` semantics
//! - Native handle accounting
//! - Devices whose parent hub is missing
//!
//! Run with: `cargo test -p usb-topology --test reconcile_tests`

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use usb_topology::test_utils::{MockBus, MockDeviceSpec, mock_descriptor};
use usb_topology::usb::NodeKind;
use usb_topology::{DeviceId, DeviceManager, DeviceSpeed, TopologyError};

fn ids(specs: &[&MockDeviceSpec]) -> HashSet<DeviceId> {
    specs.iter().map(|spec| spec.id()).collect()
}

fn root_ids(manager: &DeviceManager<MockBus>) -> HashSet<DeviceId> {
    manager
        .root_hub()
        .attached_devices()
        .iter()
        .map(|node| *node.id())
        .collect()
}

// ============================================================================
// Topology Example
// ============================================================================

#[test]
fn test_hub_then_child_then_empty_bus() {
    let hub = MockDeviceSpec::hub(1, 1, 1);
    let child = MockDeviceSpec::mass_storage(1, 2, 1).with_parent(&hub);
    let bus = MockBus::with_devices(vec![hub.clone()]);
    let manager = DeviceManager::new(bus.clone());

    // Hub on a root port
    manager.scan().unwrap();
    assert_eq!(manager.len(), 1);
    let hub_node = manager.get_device(&hub.id()).unwrap();
    assert!(hub_node.is_hub());
    assert_eq!(root_ids(&manager), ids(&[&hub]));

    // Leaf device plugged into the hub
    bus.plug(child.clone());
    let report = manager.scan().unwrap();
    assert_eq!(report.added, vec![child.id()]);
    assert!(report.removed.is_empty());
    assert_eq!(manager.len(), 2);

    let child_node = manager.get_device(&child.id()).unwrap();
    assert!(!child_node.is_hub());
    assert_eq!(child_node.parent_id(), Some(&hub.id()));
    assert!(hub_node.ports().unwrap().contains(&child.id()));
    // Only the hub hangs off the root
    assert_eq!(root_ids(&manager), ids(&[&hub]));

    // Everything unplugged
    bus.set_devices(vec![]);
    let report = manager.scan().unwrap();
    assert_eq!(report.removed.len(), 2);
    assert!(manager.is_empty());
    assert!(manager.root_hub().attached_devices().is_empty());
    assert!(hub_node.attached_devices().is_empty());
}

#[test]
fn test_node_attributes_fixed_at_construction() {
    let hub = MockDeviceSpec::hub(1, 1, 0).with_speed(DeviceSpeed::Super);
    let mouse = MockDeviceSpec::hid(1, 7, 3).with_parent(&hub);
    let manager = DeviceManager::new(MockBus::with_devices(vec![hub.clone(), mouse.clone()]));
    manager.scan().unwrap();

    let hub_node = manager.get_device(&hub.id()).unwrap();
    assert_eq!(hub_node.speed(), DeviceSpeed::Super);
    assert!(hub_node.parent_id().is_none());
    assert!(matches!(hub_node.kind(), NodeKind::Hub(_)));

    let mouse_node = manager.get_device(&mouse.id()).unwrap();
    assert_eq!(mouse_node.speed(), DeviceSpeed::Full);
    assert_eq!(mouse_node.id().port_number(), 3);
    assert!(matches!(mouse_node.kind(), NodeKind::NonHub));
}

// ============================================================================
// Resident Set Tests
// ============================================================================

#[test]
fn test_resident_set_follows_snapshots() {
    let hub = MockDeviceSpec::hub(1, 1, 0);
    let stick = MockDeviceSpec::mass_storage(1, 2, 1).with_parent(&hub);
    let mouse = MockDeviceSpec::hid(1, 3, 2).with_parent(&hub);
    let broken = MockDeviceSpec::hid(2, 1, 0).unreadable();
    let keyboard = MockDeviceSpec::hid(2, 2, 1);

    let snapshots = vec![
        vec![hub.clone()],
        vec![hub.clone(), stick.clone(), broken.clone()],
        vec![hub.clone(), stick.clone(), mouse.clone(), keyboard.clone()],
        vec![keyboard.clone(), broken.clone()],
        vec![hub.clone(), mouse.clone()],
        vec![],
    ];
    let expected = vec![
        ids(&[&hub]),
        ids(&[&hub, &stick]),
        ids(&[&hub, &stick, &mouse, &keyboard]),
        ids(&[&keyboard]),
        ids(&[&hub, &mouse]),
        HashSet::new(),
    ];

    let bus = MockBus::new();
    let manager = DeviceManager::new(bus.clone());

    for (snapshot, expected) in snapshots.into_iter().zip(expected) {
        bus.set_devices(snapshot);
        manager.scan().unwrap();
        assert_eq!(manager.device_ids(), expected);
        assert_eq!(manager.tree().count(), expected.len());
    }
}

#[test]
fn test_unreadable_device_is_skipped() {
    let broken = MockDeviceSpec::mass_storage(1, 4, 2).unreadable();
    let bus = MockBus::with_devices(vec![broken.clone()]);
    let manager = DeviceManager::new(bus.clone());

    let report = manager.scan().unwrap();
    assert!(report.added.is_empty());
    assert!(manager.is_empty());
    assert_eq!(bus.ledger().live(), 0);

    // Readable on the next cycle
    let mut fixed = broken.clone();
    fixed.readable = true;
    bus.set_devices(vec![fixed.clone()]);
    manager.scan().unwrap();
    assert!(manager.contains(&fixed.id()));
}

#[test]
fn test_scan_is_idempotent() {
    let hub = MockDeviceSpec::hub(1, 1, 0);
    let bus = MockBus::with_devices(vec![
        hub.clone(),
        MockDeviceSpec::mass_storage(1, 2, 1).with_parent(&hub),
        MockDeviceSpec::hid(1, 3, 2).with_parent(&hub),
    ]);
    let manager = DeviceManager::new(bus);

    let first = manager.scan().unwrap();
    assert_eq!(first.added.len(), 3);
    let before: Vec<_> = manager.devices();

    let second = manager.scan().unwrap();
    assert!(!second.has_changes());
    assert!(second.added.is_empty());
    assert!(second.removed.is_empty());

    // Same node objects, not rebuilt
    let after = manager.devices();
    assert_eq!(before.len(), after.len());
    for (a, b) in before.iter().zip(after.iter()) {
        assert!(Arc::ptr_eq(a, b));
    }
}

// ============================================================================
// Address Reuse Tests
// ============================================================================

#[test]
fn test_address_reuse_in_same_cycle_is_not_merged() {
    let old = MockDeviceSpec::mass_storage(1, 5, 2);
    let new = MockDeviceSpec::new(1, 5, 2, mock_descriptor(0x00, 0x1915, 0x520f));
    let bus = MockBus::with_devices(vec![old.clone()]);
    let manager = DeviceManager::new(bus.clone());

    manager.scan().unwrap();
    let old_node = manager.get_device(&old.id()).unwrap();

    bus.set_devices(vec![new.clone()]);
    let report = manager.scan().unwrap();
    assert_eq!(report.removed, vec![old.id()]);
    assert_eq!(report.added, vec![new.id()]);

    assert!(!manager.contains(&old.id()));
    let new_node = manager.get_device(&new.id()).unwrap();
    assert!(!Arc::ptr_eq(&old_node, &new_node));
    assert_ne!(old_node.id(), new_node.id());
    assert_eq!(root_ids(&manager), ids(&[&new]));

    // Old handle only kept alive by our local Arc
    assert_eq!(bus.ledger().live(), 2);
    drop(old_node);
    assert_eq!(bus.ledger().live(), 1);
}

#[test]
fn test_device_moved_to_other_port_gets_new_node() {
    let hub = MockDeviceSpec::hub(1, 1, 0);
    let on_port_1 = MockDeviceSpec::hid(1, 2, 1).with_parent(&hub);
    let on_port_3 = MockDeviceSpec::hid(1, 2, 3).with_parent(&hub);
    let bus = MockBus::with_devices(vec![hub.clone(), on_port_1.clone()]);
    let manager = DeviceManager::new(bus.clone());
    manager.scan().unwrap();

    bus.set_devices(vec![hub.clone(), on_port_3.clone()]);
    manager.scan().unwrap();

    let hub_node = manager.get_device(&hub.id()).unwrap();
    let ports = hub_node.ports().unwrap();
    assert!(!ports.contains(&on_port_1.id()));
    assert!(ports.contains(&on_port_3.id()));
    assert_eq!(ports.len(), 1);
}

// ============================================================================
// Enumeration Failure Tests
// ============================================================================

#[test]
fn test_enumeration_failure_leaves_topology_untouched() {
    let hub = MockDeviceSpec::hub(1, 1, 0);
    let stick = MockDeviceSpec::mass_storage(1, 2, 1).with_parent(&hub);
    let bus = MockBus::with_devices(vec![hub.clone(), stick.clone()]);
    let manager = DeviceManager::new(bus.clone());
    manager.scan().unwrap();

    let before = manager.devices();
    let tree_before = manager.tree();

    // The bus changed, but listing fails
    bus.set_devices(vec![MockDeviceSpec::hid(2, 1, 0)]);
    bus.fail_with(Some(rusb::Error::Io));

    let err = manager.scan().unwrap_err();
    assert!(matches!(err, TopologyError::Scan { source: rusb::Error::Io }));
    assert!(err.to_string().contains("Unable to scan USB devices"));

    let after = manager.devices();
    assert_eq!(before.len(), after.len());
    for (a, b) in before.iter().zip(after.iter()) {
        assert!(Arc::ptr_eq(a, b));
    }
    assert_eq!(manager.tree(), tree_before);
    assert_eq!(bus.ledger().live(), 2);

    // Recovers on the next successful cycle
    bus.fail_with(None);
    let report = manager.scan().unwrap();
    assert_eq!(report.removed.len(), 2);
    assert_eq!(report.added.len(), 1);
}

// ============================================================================
// First Scan Tests
// ============================================================================

#[test]
fn test_first_scan_runs_once() {
    let bus = MockBus::with_devices(vec![MockDeviceSpec::hub(1, 1, 0)]);
    let manager = DeviceManager::new(bus.clone());

    for _ in 0..5 {
        manager.first_scan().unwrap();
    }
    assert_eq!(bus.list_calls(), 1);
    assert_eq!(manager.len(), 1);

    // Explicit scans still run
    manager.scan().unwrap();
    assert_eq!(bus.list_calls(), 2);
}

#[test]
fn test_first_scan_after_regular_scan_is_noop() {
    let bus = MockBus::new();
    let manager = DeviceManager::new(bus.clone());
    manager.scan().unwrap();

    manager.first_scan().unwrap();
    assert_eq!(bus.list_calls(), 1);
}

#[test]
fn test_first_scan_retries_after_failure() {
    let bus = MockBus::with_devices(vec![MockDeviceSpec::hub(1, 1, 0)]);
    bus.fail_with(Some(rusb::Error::NoMem));
    let manager = DeviceManager::new(bus.clone());

    assert!(manager.first_scan().is_err());
    assert!(!manager.has_scanned());

    bus.fail_with(None);
    manager.first_scan().unwrap();
    manager.first_scan().unwrap();
    assert_eq!(bus.list_calls(), 2);
    assert!(manager.has_scanned());
}

#[test]
fn test_concurrent_first_scan_scans_once() {
    let bus = MockBus::with_devices(vec![
        MockDeviceSpec::hub(1, 1, 0),
        MockDeviceSpec::hid(1, 2, 0),
    ]);
    let manager = Arc::new(DeviceManager::new(bus.clone()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.first_scan())
        })
        .collect();

    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(bus.list_calls(), 1);
    assert_eq!(manager.len(), 2);
}

// ============================================================================
// Handle Accounting Tests
// ============================================================================

#[test]
fn test_one_live_handle_per_resident_node() {
    let hub = MockDeviceSpec::hub(1, 1, 0);
    let stick = MockDeviceSpec::mass_storage(1, 2, 1).with_parent(&hub);
    let mouse = MockDeviceSpec::hid(1, 3, 2).with_parent(&hub);
    let bus = MockBus::new();
    let manager = DeviceManager::new(bus.clone());

    let snapshots = vec![
        vec![hub.clone(), stick.clone()],
        vec![hub.clone(), stick.clone(), mouse.clone()],
        vec![hub.clone(), mouse.clone()],
        vec![mouse.clone().unreadable()],
        vec![hub.clone(), stick.clone(), mouse.clone()],
    ];

    for snapshot in snapshots {
        bus.set_devices(snapshot);
        manager.scan().unwrap();
        assert_eq!(bus.ledger().live(), manager.len());
    }

    manager.dispose();
    assert_eq!(bus.ledger().live(), 0);
    assert_eq!(bus.ledger().acquired(), bus.ledger().released());
}

#[test]
fn test_failed_scan_releases_nothing_twice() {
    let bus = MockBus::with_devices(vec![MockDeviceSpec::hub(1, 1, 0)]);
    let manager = DeviceManager::new(bus.clone());
    manager.scan().unwrap();
    let acquired = bus.ledger().acquired();
    let released = bus.ledger().released();

    bus.fail_with(Some(rusb::Error::Busy));
    assert!(manager.scan().is_err());
    assert_eq!(bus.ledger().acquired(), acquired);
    assert_eq!(bus.ledger().released(), released);
}

#[test]
fn test_get_device_handle_pairs_with_release() {
    let stick = MockDeviceSpec::mass_storage(1, 2, 1);
    let bus = MockBus::with_devices(vec![stick.clone()]);
    let manager = DeviceManager::new(bus.clone());
    manager.scan().unwrap();
    assert_eq!(bus.ledger().live(), 1);

    let handle = manager.get_device_handle(&stick.id()).unwrap();
    assert_eq!(bus.ledger().live(), 2);
    assert_eq!(handle.spec(), &stick);

    manager.release_handle(handle);
    assert_eq!(bus.ledger().live(), 1);
}

#[test]
fn test_get_device_handle_not_found() {
    let bus = MockBus::with_devices(vec![MockDeviceSpec::hub(1, 1, 0)]);
    let manager = DeviceManager::new(bus.clone());
    let missing = MockDeviceSpec::hid(3, 9, 1).id();

    let err = manager.get_device_handle(&missing).unwrap_err();
    assert!(matches!(err, TopologyError::DeviceNotFound(id) if id == missing));
    assert_eq!(bus.ledger().live(), 0);
}

// ============================================================================
// Missing Parent Tests
// ============================================================================

#[test]
fn test_child_of_unlisted_parent_is_orphaned_then_attached() {
    let hub = MockDeviceSpec::hub(1, 1, 0);
    let stick = MockDeviceSpec::mass_storage(1, 2, 1).with_parent(&hub);
    // The hub itself is missing from the listing
    let bus = MockBus::with_devices(vec![stick.clone()]);
    let manager = DeviceManager::new(bus.clone());

    let report = manager.scan().unwrap();
    assert_eq!(report.added, vec![stick.id()]);
    assert_eq!(report.orphaned, vec![stick.id()]);
    assert!(manager.contains(&stick.id()));
    assert!(manager.root_hub().attached_devices().is_empty());
    assert_eq!(manager.orphans(), vec![stick.id()]);

    // The hub shows up; the orphan is attached below it
    bus.set_devices(vec![hub.clone(), stick.clone()]);
    let report = manager.scan().unwrap();
    assert_eq!(report.added, vec![hub.id()]);
    assert!(report.orphaned.is_empty());

    let hub_node = manager.get_device(&hub.id()).unwrap();
    assert!(hub_node.ports().unwrap().contains(&stick.id()));
    assert_eq!(manager.tree().count(), 2);
}

#[test]
fn test_child_of_non_hub_parent_is_orphaned() {
    let composite = MockDeviceSpec::hid(1, 1, 0);
    let child = MockDeviceSpec::mass_storage(1, 2, 1).with_parent(&composite);
    let manager = DeviceManager::new(MockBus::with_devices(vec![composite.clone(), child.clone()]));

    let report = manager.scan().unwrap();
    assert_eq!(report.added.len(), 2);
    assert_eq!(report.orphaned, vec![child.id()]);
    assert!(manager.get_device(&composite.id()).unwrap().attached_devices().is_empty());
}

#[test]
fn test_children_of_removed_hub_become_orphans() {
    let hub = MockDeviceSpec::hub(1, 1, 0);
    let stick = MockDeviceSpec::mass_storage(1, 2, 1).with_parent(&hub);
    let bus = MockBus::with_devices(vec![hub.clone(), stick.clone()]);
    let manager = DeviceManager::new(bus.clone());
    manager.scan().unwrap();
    let old_hub = manager.get_device(&hub.id()).unwrap();

    // Hub vanishes from the listing while the child is still reported
    bus.set_devices(vec![stick.clone()]);
    let report = manager.scan().unwrap();
    assert_eq!(report.removed, vec![hub.id()]);
    assert_eq!(report.orphaned, vec![stick.id()]);
    assert!(old_hub.attached_devices().is_empty());

    // Hub comes back: a new node, which adopts the child
    bus.set_devices(vec![hub.clone(), stick.clone()]);
    let report = manager.scan().unwrap();
    assert!(report.orphaned.is_empty());
    let new_hub = manager.get_device(&hub.id()).unwrap();
    assert!(!Arc::ptr_eq(&old_hub, &new_hub));
    assert!(new_hub.ports().unwrap().contains(&stick.id()));
}

#[test]
fn test_orphan_removed_while_waiting() {
    let hub = MockDeviceSpec::hub(1, 1, 0);
    let stick = MockDeviceSpec::mass_storage(1, 2, 1).with_parent(&hub);
    let bus = MockBus::with_devices(vec![stick.clone()]);
    let manager = DeviceManager::new(bus.clone());
    manager.scan().unwrap();
    assert_eq!(manager.orphans().len(), 1);

    bus.set_devices(vec![]);
    let report = manager.scan().unwrap();
    assert_eq!(report.removed, vec![stick.id()]);
    assert!(report.orphaned.is_empty());
    assert_eq!(bus.ledger().live(), 0);
}

#[test]
fn test_nested_hubs_in_one_snapshot() {
    let outer = MockDeviceSpec::hub(1, 1, 0);
    let inner = MockDeviceSpec::hub(1, 2, 4).with_parent(&outer);
    let leaf = MockDeviceSpec::hid(1, 3, 1).with_parent(&inner);
    // Deepest device listed first
    let bus = MockBus::with_devices(vec![leaf.clone(), inner.clone(), outer.clone()]);
    let manager = DeviceManager::new(bus.clone());

    let report = manager.scan().unwrap();
    assert!(report.orphaned.is_empty());

    let tree = manager.tree();
    assert_eq!(tree.devices.len(), 1);
    assert_eq!(tree.devices[0].children[0].id, inner.id());
    assert_eq!(tree.devices[0].children[0].children[0].id, leaf.id());

    // Whole chain unplugged in one go
    bus.set_devices(vec![]);
    manager.scan().unwrap();
    assert!(manager.is_empty());
    assert!(manager.tree().is_empty());
    assert_eq!(bus.ledger().live(), 0);
}

#[test]
fn test_parents_resolved_while_device_list_alive() {
    let outer = MockDeviceSpec::hub(1, 1, 0);
    let inner = MockDeviceSpec::hub(1, 2, 4).with_parent(&outer);
    let stick = MockDeviceSpec::mass_storage(1, 3, 1).with_parent(&inner);
    let bus = MockBus::with_devices(vec![stick.clone(), outer.clone(), inner.clone()]);
    let manager = DeviceManager::new(bus.clone());

    manager.scan().unwrap();
    bus.unplug(&stick);
    manager.scan().unwrap();
    bus.plug(stick.clone());
    manager.scan().unwrap();

    let inner_node = manager.get_device(&inner.id()).unwrap();
    assert!(inner_node.ports().unwrap().contains(&stick.id()));
    assert_eq!(bus.ledger().stale_parent_lookups(), 0);
}

#[test]
fn test_unreadable_parent_attaches_child_to_root() {
    let hub = MockDeviceSpec::hub(1, 1, 0).unreadable();
    let mouse = MockDeviceSpec::hid(1, 2, 1).with_parent(&hub);
    let manager = DeviceManager::new(MockBus::with_devices(vec![hub, mouse.clone()]));

    manager.scan().unwrap();
    let node = manager.get_device(&mouse.id()).unwrap();
    assert!(node.parent_id().is_none());
    assert_eq!(root_ids(&manager), ids(&[&mouse]));
}

// ============================================================================
// Concurrent Access Tests
// ============================================================================

#[test]
fn test_readers_during_scans() {
    let hub = MockDeviceSpec::hub(1, 1, 0);
    let stick = MockDeviceSpec::mass_storage(1, 2, 1).with_parent(&hub);
    let bus = MockBus::new();
    let manager = Arc::new(DeviceManager::new(bus.clone()));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let stick_id = stick.id();
            thread::spawn(move || {
                for _ in 0..500 {
                    let count = manager.devices().len();
                    assert!(count <= 2);
                    if let Some(node) = manager.get_device(&stick_id) {
                        assert_eq!(node.id(), &stick_id);
                    }
                    let _ = manager.tree();
                }
            })
        })
        .collect();

    for round in 0..200 {
        if round % 2 == 0 {
            bus.set_devices(vec![hub.clone(), stick.clone()]);
        } else {
            bus.set_devices(vec![]);
        }
        manager.scan().unwrap();
    }

    for reader in readers {
        reader.join().unwrap();
    }

    // Last round (199) emptied the bus
    assert!(manager.is_empty());
    assert_eq!(bus.ledger().live(), 0);
}

#[test]
fn test_readers_not_blocked_by_slow_listing() {
    let hub = MockDeviceSpec::hub(1, 1, 0);
    let stick = MockDeviceSpec::mass_storage(1, 2, 1).with_parent(&hub);
    let bus = MockBus::with_devices(vec![stick.clone()]);
    let manager = Arc::new(DeviceManager::new(bus.clone()));
    manager.scan().unwrap();
    assert_eq!(manager.orphans(), vec![stick.id()]);

    bus.set_list_delay(Some(Duration::from_millis(800)));
    let scan_manager = Arc::clone(&manager);
    let scan = thread::spawn(move || scan_manager.scan());

    // Wait until the scan sits in the listing call
    while bus.list_calls() < 2 {
        thread::yield_now();
    }

    let started = Instant::now();
    assert_eq!(manager.len(), 1);
    assert_eq!(manager.orphans(), vec![stick.id()]);
    let _ = manager.tree();
    let elapsed = started.elapsed();
    assert!(
        elapsed < Duration::from_millis(400),
        "readers waited {:?} on the scan",
        elapsed
    );

    scan.join().unwrap().unwrap();
}
