//! Textual memory map.
//!
//! Draws one 100-column bar per buffer, scaled to the size of its region.
//! Each tag is placed at the left edge, or at the right edge when that would
//! hide its own bar.

use crate::codegen::PlacedBuffer;
use crate::core::{AddressRecord, ArenaHandle, ConstHandle};

const BAR_WIDTH: usize = 100;
const LABEL_MARGIN: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    base: usize,
    len: usize,
    tag: String,
}

/// Buffers of the constant data and the arena, for display.
#[derive(Debug, Default, Clone)]
pub struct MemoryMap {
    const_entries: Vec<Entry>,
    arena_entries: Vec<Entry>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map of every placed buffer of a generated program.
    pub fn from_buffers(buffers: &[PlacedBuffer]) -> Self {
        let mut map = Self::new();
        for buffer in buffers {
            map.record(buffer.address, buffer.bytes, buffer.tag.clone());
        }
        map
    }

    /// Add a buffer. Null addresses are ignored.
    pub fn record(&mut self, address: AddressRecord, len: usize, tag: impl Into<String>) {
        match address {
            AddressRecord::Null => {}
            AddressRecord::Arena(ArenaHandle(base)) => self.arena_entries.push(Entry {
                base,
                len,
                tag: tag.into(),
            }),
            AddressRecord::Const(ConstHandle(base)) => self.const_entries.push(Entry {
                base,
                len,
                tag: tag.into(),
            }),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        render_region(&mut out, "Const", &self.const_entries);
        render_region(&mut out, "Arena", &self.arena_entries);
        out
    }
}

fn render_region(out: &mut String, name: &str, entries: &[Entry]) {
    let total = entries.iter().map(|e| e.base + e.len).max().unwrap_or(0);
    out.push_str(&format!("{name} summary: {total} bytes total\n"));
    out.push_str(&frame());
    if total > 0 {
        for entry in entries {
            let start = entry.base * BAR_WIDTH / total;
            let end = (entry.base + entry.len) * BAR_WIDTH / total;
            out.push_str(&bar(&entry.tag, start, end));
        }
    }
    out.push_str(&frame());
}

fn frame() -> String {
    let mut line = "#".repeat(BAR_WIDTH + 2);
    line.push('\n');
    line
}

/// One row: the bar covers columns `start..end`.
fn bar(tag: &str, start: usize, end: usize) -> String {
    let (start, end, small) = if start == end {
        (start.min(BAR_WIDTH - 1), (start + 1).min(BAR_WIDTH), true)
    } else {
        (start, end, false)
    };

    let label: Vec<char> = tag.chars().take(BAR_WIDTH - 2 * LABEL_MARGIN).collect();
    let overlaps = |label_start: usize| label_start < end && label_start + label.len() > start;
    let mut label_start = LABEL_MARGIN;
    if overlaps(label_start) {
        label_start = BAR_WIDTH - LABEL_MARGIN - label.len();
        if overlaps(label_start) {
            label_start = (BAR_WIDTH - label.len()) / 2;
        }
    }

    let mut line = String::with_capacity(BAR_WIDTH + 3);
    line.push('#');
    for col in 0..BAR_WIDTH {
        if col >= label_start && col < label_start + label.len() {
            line.push(label[col - label_start]);
        } else if col >= start && col < end {
            line.push(if small { '|' } else { 'X' });
        } else {
            line.push('.');
        }
    }
    line.push_str("#\n");
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bar_avoids_hiding_itself() {
        let row = bar("tensor 1", 0, 50);
        assert_eq!(row.len(), BAR_WIDTH + 3);
        assert!(row.starts_with("#XXXX"));
        assert!(row.contains("tensor 1...#"));

        let row = bar("tensor 2", 50, 100);
        assert!(row.starts_with("#...tensor 2"));
        assert!(row.ends_with("XXX#\n"));
    }

    #[test]
    fn test_zero_width_bar() {
        let row = bar("p", 40, 40);
        assert_eq!(row.matches('|').count(), 1);
    }

    #[test]
    fn test_render_regions() {
        let mut map = MemoryMap::new();
        map.record(AddressRecord::Arena(ArenaHandle(0)), 64, "tensor 0");
        map.record(AddressRecord::Arena(ArenaHandle(64)), 64, "tensor 2");
        map.record(AddressRecord::Const(ConstHandle(16)), 48, "tensor 1");
        map.record(AddressRecord::Null, 16, "tensor 3");

        let text = map.render();
        assert!(text.contains("Const summary: 64 bytes total"));
        assert!(text.contains("Arena summary: 128 bytes total"));
        assert!(!text.contains("tensor 3"));
        // Summary line and two frames per region, plus one row per entry.
        assert_eq!(text.lines().count(), 3 + 1 + 3 + 2);
    }

    #[test]
    fn test_empty_map() {
        let text = MemoryMap::new().render();
        assert!(text.contains("Arena summary: 0 bytes total"));
    }
}
