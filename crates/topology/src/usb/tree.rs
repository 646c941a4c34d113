//! Read-only snapshot of the device tree
//!
//! Used for display (`usb-topology` prints it like `lsusb -t`) and JSON
//! output. Capturing never holds more than one port lock at a time.

use crate::usb::backend::{DeviceSpeed, NativeDevice};
use crate::usb::device::{RootHub, UsbNode};
use crate::usb::id::DeviceId;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    pub id: DeviceId,
    pub speed: DeviceSpeed,
    pub hub: bool,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    fn capture<D: NativeDevice>(node: &UsbNode<D>) -> Self {
        Self {
            id: *node.id(),
            speed: node.speed(),
            hub: node.is_hub(),
            children: capture_all(node.attached_devices()),
        }
    }

    /// Number of nodes in this subtree, this one included
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(TreeNode::count).sum::<usize>()
    }

    pub fn find(&self, id: &DeviceId) -> Option<&TreeNode> {
        if self.id == *id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        writeln!(
            f,
            "{:indent$}|__ Port {}: Dev {:03}, {:04x}:{:04x}{}, {}",
            "",
            self.id.port_number(),
            self.id.address(),
            self.id.vendor_id(),
            self.id.product_id(),
            if self.hub { " hub" } else { "" },
            self.speed,
            indent = depth * 4 + 2
        )?;
        for child in &self.children {
            child.write_indented(f, depth + 1)?;
        }
        Ok(())
    }
}

fn capture_all<D: NativeDevice>(nodes: Vec<std::sync::Arc<UsbNode<D>>>) -> Vec<TreeNode> {
    let mut captured: Vec<TreeNode> = nodes.iter().map(|node| TreeNode::capture(node)).collect();
    captured.sort_by(|a, b| a.id.cmp(&b.id));
    captured
}

/// Devices below the virtual root hub, ordered by bus and address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopologyTree {
    pub devices: Vec<TreeNode>,
}

impl TopologyTree {
    pub fn capture<D: NativeDevice>(root: &RootHub<D>) -> Self {
        Self {
            devices: capture_all(root.attached_devices()),
        }
    }

    /// Number of devices reachable from the root hub
    pub fn count(&self) -> usize {
        self.devices.iter().map(TreeNode::count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn find(&self, id: &DeviceId) -> Option<&TreeNode> {
        self.devices.iter().find_map(|node| node.find(id))
    }
}

impl fmt::Display for TopologyTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut current_bus = None;
        for node in &self.devices {
            let bus = node.id.bus_number();
            if current_bus != Some(bus) {
                writeln!(f, "Bus {:03}", bus)?;
                current_bus = Some(bus);
            }
            node.write_indented(f, 0)?;
        }
        Ok(())
    }
}
