use std::collections::HashMap;

use crate::elements::ParentRef;

/// Owner of the mark namespace for one run.
///
/// The input stream numbers its own marks, and those numbers need not
/// line up with the marks we assign to the elements we construct
/// (combined streams can even collide). Every parent or blob
/// reference read from the input is translated through this table
/// before it is used; a mark can also be renamed to an external hex
/// id, or to nothing at all when the object it named was pruned and
/// has no surviving ancestor.
#[derive(Debug, Default)]
pub struct MarkTable {
    next: u32,
    forward: HashMap<u32, Option<ParentRef>>,
    reverse: HashMap<u32, Vec<u32>>,
}

impl MarkTable {
    pub fn new() -> Self {
        MarkTable {
            next: 1,
            forward: HashMap::new(),
            reverse: HashMap::new(),
        }
    }

    /// Allocate the mark for a newly constructed blob/commit/tag.
    pub fn new_mark(&mut self) -> u32 {
        let mark = self.next;
        self.next += 1;
        mark
    }

    /// Record that `old` now refers to `new`. With `transitive`,
    /// anything previously renamed to `old` is repointed at `new` as
    /// well, keeping the table idempotent.
    pub fn record_rename(&mut self, old: u32, new: Option<ParentRef>, transitive: bool) {
        if new == Some(ParentRef::Mark(old)) {
            return;
        }
        self.forward.insert(old, new.clone());
        if transitive {
            if let Some(pointing_here) = self.reverse.remove(&old) {
                for id in &pointing_here {
                    self.forward.insert(*id, new.clone());
                }
                if let Some(ParentRef::Mark(m)) = new {
                    self.reverse.entry(m).or_default().extend(pointing_here);
                }
            }
        }
        if let Some(ParentRef::Mark(m)) = new {
            self.reverse.entry(m).or_default().push(old);
        }
    }

    /// Resolve a mark read from the input. Unrecorded marks map to
    /// themselves; `None` means the object was pruned away entirely.
    pub fn translate(&self, mark: u32) -> Option<ParentRef> {
        match self.forward.get(&mark) {
            Some(mapped) => mapped.clone(),
            None => Some(ParentRef::Mark(mark)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_defaults_to_identity() {
        let table = MarkTable::new();
        assert_eq!(table.translate(7), Some(ParentRef::Mark(7)));
    }

    #[test]
    fn new_marks_are_monotonic_from_one() {
        let mut table = MarkTable::new();
        assert_eq!(table.new_mark(), 1);
        assert_eq!(table.new_mark(), 2);
        assert_eq!(table.new_mark(), 3);
    }

    #[test]
    fn rename_chain_collapses_transitively() {
        let mut table = MarkTable::new();
        table.record_rename(1, Some(ParentRef::Mark(2)), true);
        table.record_rename(2, Some(ParentRef::Mark(3)), true);
        assert_eq!(table.translate(1), Some(ParentRef::Mark(3)));
        assert_eq!(table.translate(2), Some(ParentRef::Mark(3)));
        // Idempotence: translating an already-translated mark is stable.
        if let Some(ParentRef::Mark(m)) = table.translate(1) {
            assert_eq!(table.translate(m), Some(ParentRef::Mark(m)));
        }
    }

    #[test]
    fn rename_to_nothing_and_to_hash() {
        let mut table = MarkTable::new();
        table.record_rename(4, None, true);
        assert_eq!(table.translate(4), None);
        let hex = ParentRef::Hash(b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_vec());
        table.record_rename(5, Some(hex.clone()), true);
        assert_eq!(table.translate(5), Some(hex));
    }

    #[test]
    fn transitive_rename_repoints_earlier_entries() {
        let mut table = MarkTable::new();
        table.record_rename(10, Some(ParentRef::Mark(11)), true);
        table.record_rename(12, Some(ParentRef::Mark(11)), true);
        table.record_rename(11, None, true);
        assert_eq!(table.translate(10), None);
        assert_eq!(table.translate(12), None);
        assert_eq!(table.translate(11), None);
    }
}
