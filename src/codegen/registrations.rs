//! Registration slots.
//!
//! Nodes sharing an (operator, version) pair share one registration. Slots
//! are numbered in the order their first node appears.

use crate::model::BuiltinOperator;
use crate::recorder::RecordedNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration<'a> {
    pub opcode: BuiltinOperator,
    pub version: u32,
    pub name: &'a str,
}

#[derive(Debug, Clone)]
pub struct RegistrationTable<'a> {
    entries: Vec<Registration<'a>>,
    node_slots: Vec<usize>,
}

impl<'a> RegistrationTable<'a> {
    pub fn build(nodes: &[RecordedNode<'a>]) -> Self {
        let mut entries: Vec<Registration<'a>> = Vec::new();
        let mut node_slots = Vec::with_capacity(nodes.len());
        for node in nodes {
            let slot = match entries
                .iter()
                .position(|reg| reg.opcode == node.opcode && reg.version == node.version)
            {
                Some(slot) => slot,
                None => {
                    entries.push(Registration {
                        opcode: node.opcode,
                        version: node.version,
                        name: node.kernel_name,
                    });
                    entries.len() - 1
                }
            };
            node_slots.push(slot);
        }
        Self { entries, node_slots }
    }

    pub fn entries(&self) -> &[Registration<'a>] {
        &self.entries
    }

    /// Slot used by node `index`.
    pub fn slot(&self, index: usize) -> usize {
        self.node_slots[index]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
