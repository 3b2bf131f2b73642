/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::disk::utilities::format_guid;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionFormat {
    Mbr,
    Gpt,
}

/// One node of a device path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathNode {
    /// Controller or host node, e.g. a PCI function or a host file.
    Device(String),
    Usb { port: u8 },
    /// Hard drive partition node. Partition 0 stands for the whole device.
    HardDrive {
        number: u32,
        start_lba: u64,
        size_lba: u64,
        signature: [u8; 16],
        format: PartitionFormat,
    },
}

impl fmt::Display for PathNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathNode::Device(name) => write!(f, "{}", name),
            PathNode::Usb { port } => write!(f, "USB({:#X})", port),
            PathNode::HardDrive {
                number,
                start_lba,
                size_lba,
                signature,
                format,
            } => match format {
                PartitionFormat::Gpt => write!(
                    f,
                    "HD({},GPT,{},{:#X},{:#X})",
                    number,
                    format_guid(signature),
                    start_lba,
                    size_lba
                ),
                PartitionFormat::Mbr => {
                    write!(f, "HD({},MBR,{:#X},{:#X})", number, start_lba, size_lba)
                }
            },
        }
    }
}

/// Location of a block handle, from the controller down to the partition.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DevicePath(Vec<PathNode>);

impl DevicePath {
    pub fn new(nodes: Vec<PathNode>) -> Self {
        Self(nodes)
    }

    pub fn from_device(name: &str) -> Self {
        Self(vec![PathNode::Device(name.to_string())])
    }

    pub fn nodes(&self) -> &[PathNode] {
        &self.0
    }

    pub fn join(&self, node: PathNode) -> Self {
        let mut nodes = self.0.clone();
        nodes.push(node);
        Self(nodes)
    }

    pub fn is_usb(&self) -> bool {
        self.0.iter().any(|n| matches!(n, PathNode::Usb { .. }))
    }

    /// Nodes that follow `parent` when this path strictly extends it.
    pub fn child_nodes(&self, parent: &DevicePath) -> Option<&[PathNode]> {
        if self.0.len() > parent.0.len() && self.0.starts_with(&parent.0) {
            Some(&self.0[parent.0.len()..])
        } else {
            None
        }
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, node) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{}", node)?;
        }
        Ok(())
    }
}
