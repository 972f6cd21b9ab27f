use super::{BranchInstruction, Encoding, InsnHandle, ListId, ListInstruction, Targeter};
use crate::jvm::Error;
use crate::util::{Offset, OffsetVec, Width};
use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Formatter};

/// Mapping from handles in one list to the corresponding handles in another
pub type HandleMap = HashMap<InsnHandle, InsnHandle>;

/// Arena node of an instruction list
#[derive(Debug, Clone)]
pub(super) struct Node {
    pub(super) insn: ListInstruction,

    /// Fixed at creation: branch handles only ever hold branch instructions
    pub(super) is_branch: bool,

    pub(super) prev: Option<InsnHandle>,
    pub(super) next: Option<InsnHandle>,

    /// Whether the node is linked into the list (deleted but still targeted nodes are not)
    pub(super) attached: bool,

    pub(super) targeters: HashSet<Targeter>,

    /// Byte offset and encoded width (only meaningful while the list is resolved)
    pub(super) offset: usize,
    pub(super) width: usize,

    /// Short jump which has been widened (`goto_w`, or inverted conditional over `goto_w`)
    pub(super) wide: bool,

    /// Encoding of a straight instruction (decoded code keeps the encoding it was read in)
    pub(super) encoding: Encoding,
}

impl Node {
    fn new(insn: ListInstruction) -> Node {
        Node {
            is_branch: insn.is_branch(),
            insn,
            prev: None,
            next: None,
            attached: false,
            targeters: HashSet::new(),
            offset: 0,
            width: 0,
            wide: false,
            encoding: Encoding::Shortest,
        }
    }

    /// Jump targets (empty for non-branches)
    pub(super) fn jump_targets(&self) -> Vec<InsnHandle> {
        match &self.insn {
            ListInstruction::Branch(branch) => branch.jump_targets().into_iter().copied().collect(),
            ListInstruction::Straight(_) => vec![],
        }
    }
}

#[derive(Debug, Clone)]
pub(super) struct Slot {
    pub(super) generation: u32,
    pub(super) node: Option<Node>,
}

/// Instruction along with its resolved width
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(super) struct Placed {
    pub(super) handle: InsnHandle,
    pub(super) width: usize,
}

impl Width for Placed {
    fn width(&self) -> usize {
        self.width
    }
}

/// Mutable sequence of JVM instructions
///
/// Instructions are addressed through [`InsnHandle`]s, which stay valid across every edit that
/// doesn't delete the instruction itself. Every instruction also knows its [`Targeter`]s: the
/// branches, exception handlers, local variable scopes, and line numbers pointing at it. That is
/// what makes deletion safe: deleting an instruction which something still points at fails with
/// the recoverable [`Error::TargetLost`], leaving the instruction detached until the targeters
/// are redirected elsewhere.
///
/// Each list owns its own arena of nodes. Disposed slots are recycled (with a bumped generation,
/// so stale handles are caught), but never shared with another list.
pub struct InstructionList {
    pub(super) id: ListId,
    pub(super) slots: Vec<Slot>,
    pub(super) free: Vec<u32>,
    pub(super) first: Option<InsnHandle>,
    pub(super) last: Option<InsnHandle>,
    pub(super) len: usize,

    /// Resolved layout, cleared by any mutation
    pub(super) layout: Option<OffsetVec<Placed>>,
}

impl InstructionList {
    pub fn new() -> InstructionList {
        InstructionList {
            id: ListId::fresh(),
            slots: vec![],
            free: vec![],
            first: None,
            last: None,
            len: 0,
            layout: None,
        }
    }

    pub fn id(&self) -> ListId {
        self.id
    }

    /// Number of instructions linked into the list
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn first(&self) -> Option<InsnHandle> {
        self.first
    }

    pub fn last(&self) -> Option<InsnHandle> {
        self.last
    }

    pub(super) fn node(&self, handle: InsnHandle) -> Result<&Node, Error> {
        if handle.list != self.id {
            return Err(Error::InvalidHandle(handle));
        }
        match self.slots.get(handle.index as usize) {
            Some(Slot {
                generation,
                node: Some(node),
            }) if *generation == handle.generation => Ok(node),
            _ => Err(Error::InvalidHandle(handle)),
        }
    }

    pub(super) fn node_mut(&mut self, handle: InsnHandle) -> Result<&mut Node, Error> {
        if handle.list != self.id {
            return Err(Error::InvalidHandle(handle));
        }
        match self.slots.get_mut(handle.index as usize) {
            Some(Slot {
                generation,
                node: Some(node),
            }) if *generation == handle.generation => Ok(node),
            _ => Err(Error::InvalidHandle(handle)),
        }
    }

    /// Node which is linked into the list
    pub(super) fn linked(&self, handle: InsnHandle) -> Result<&Node, Error> {
        let node = self.node(handle)?;
        if node.attached {
            Ok(node)
        } else {
            Err(Error::DetachedHandle(handle))
        }
    }

    /// Is the handle linked into this list?
    pub fn contains(&self, handle: InsnHandle) -> bool {
        self.linked(handle).is_ok()
    }

    /// Instruction behind a handle (which may be detached but not yet disposed)
    pub fn get(&self, handle: InsnHandle) -> Result<&ListInstruction, Error> {
        Ok(&self.node(handle)?.insn)
    }

    pub fn next(&self, handle: InsnHandle) -> Result<Option<InsnHandle>, Error> {
        Ok(self.linked(handle)?.next)
    }

    pub fn prev(&self, handle: InsnHandle) -> Result<Option<InsnHandle>, Error> {
        Ok(self.linked(handle)?.prev)
    }

    /// Everything currently referencing the instruction
    pub fn targeters(&self, handle: InsnHandle) -> Result<&HashSet<Targeter>, Error> {
        Ok(&self.node(handle)?.targeters)
    }

    /// Have positions been resolved since the last mutation?
    pub fn is_resolved(&self) -> bool {
        self.layout.is_some()
    }

    /// Byte offset of an instruction (requires resolved positions)
    pub fn position(&self, handle: InsnHandle) -> Result<Offset, Error> {
        if self.layout.is_none() {
            return Err(Error::PositionsNotResolved);
        }
        Ok(Offset(self.linked(handle)?.offset))
    }

    /// Byte offset just past an instruction (requires resolved positions)
    pub fn end_position(&self, handle: InsnHandle) -> Result<Offset, Error> {
        if self.layout.is_none() {
            return Err(Error::PositionsNotResolved);
        }
        let node = self.linked(handle)?;
        Ok(Offset(node.offset + node.width))
    }

    /// Total length of the encoded instructions (requires resolved positions)
    pub fn code_length(&self) -> Result<Offset, Error> {
        self.layout
            .as_ref()
            .map(|layout| layout.offset_len())
            .ok_or(Error::PositionsNotResolved)
    }

    /// Iterate over the handles in list order
    pub fn iter(&self) -> Handles<'_> {
        Handles {
            list: self,
            next: self.first,
        }
    }

    /// Iterate over the handles and instructions in list order
    pub fn instructions(&self) -> impl Iterator<Item = (InsnHandle, &ListInstruction)> + '_ {
        self.iter()
            .filter_map(move |handle| self.get(handle).ok().map(|insn| (handle, insn)))
    }

    /// Put an instruction in a fresh (unlinked) arena slot
    pub(super) fn allocate(&mut self, insn: ListInstruction) -> InsnHandle {
        let node = Node::new(insn);
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                InsnHandle {
                    list: self.id,
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                InsnHandle {
                    list: self.id,
                    index,
                    generation: 0,
                }
            }
        }
    }

    /// Dispose of an instruction, freeing its slot
    fn release(&mut self, handle: InsnHandle) {
        if let Some(slot) = self.slots.get_mut(handle.index as usize) {
            if slot.generation == handle.generation && slot.node.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(handle.index);
            }
        }
    }

    /// Link an unlinked chain of nodes after `prev` (or at the start if `prev` is `None`)
    fn link_chain_after(
        &mut self,
        start: InsnHandle,
        end: InsnHandle,
        count: usize,
        prev: Option<InsnHandle>,
    ) -> Result<(), Error> {
        let next = match prev {
            Some(prev) => self.node(prev)?.next,
            None => self.first,
        };
        self.node_mut(start)?.prev = prev;
        self.node_mut(end)?.next = next;
        match prev {
            Some(prev) => self.node_mut(prev)?.next = Some(start),
            None => self.first = Some(start),
        }
        match next {
            Some(next) => self.node_mut(next)?.prev = Some(end),
            None => self.last = Some(end),
        }
        self.len += count;
        self.layout = None;
        Ok(())
    }

    /// Link a single unlinked node after `prev` (or at the start if `prev` is `None`)
    pub(super) fn link_after(
        &mut self,
        handle: InsnHandle,
        prev: Option<InsnHandle>,
    ) -> Result<(), Error> {
        self.node_mut(handle)?.attached = true;
        self.link_chain_after(handle, handle, 1, prev)
    }

    /// Unlink a chain of linked nodes (the nodes keep their `attached` flag)
    fn unlink_chain(
        &mut self,
        start: InsnHandle,
        end: InsnHandle,
        count: usize,
    ) -> Result<(), Error> {
        let before = self.node(start)?.prev;
        let after = self.node(end)?.next;
        match before {
            Some(before) => self.node_mut(before)?.next = after,
            None => self.first = after,
        }
        match after {
            Some(after) => self.node_mut(after)?.prev = before,
            None => self.last = before,
        }
        self.node_mut(start)?.prev = None;
        self.node_mut(end)?.next = None;
        self.len -= count;
        self.layout = None;
        Ok(())
    }

    /// Handles from `start` to `end` (inclusive)
    fn range_handles(&self, start: InsnHandle, end: InsnHandle) -> Result<Vec<InsnHandle>, Error> {
        self.linked(start)?;
        self.linked(end)?;
        let mut handles = vec![];
        let mut current = Some(start);
        while let Some(handle) = current {
            handles.push(handle);
            if handle == end {
                return Ok(handles);
            }
            current = self.node(handle)?.next;
        }
        Err(Error::InvalidRange { start, end })
    }

    /// Check that the jump targets of a new instruction are instructions of this list
    fn check_targets(&self, insn: &ListInstruction) -> Result<(), Error> {
        if let ListInstruction::Branch(branch) = insn {
            for target in branch.jump_targets() {
                self.node(*target)?;
            }
        }
        Ok(())
    }

    /// Register a branch instruction with all of its targets
    pub(super) fn register_branch(&mut self, handle: InsnHandle) -> Result<(), Error> {
        for target in self.node(handle)?.jump_targets() {
            self.node_mut(target)?
                .targeters
                .insert(Targeter::Branch(handle));
        }
        Ok(())
    }

    /// Deregister a branch instruction from all of its targets
    fn unregister_branch(&mut self, handle: InsnHandle) {
        let targets = match self.node(handle) {
            Ok(node) => node.jump_targets(),
            Err(_) => return,
        };
        for target in targets {
            self.remove_targeter(target, &Targeter::Branch(handle));
        }
    }

    pub(super) fn add_targeter(
        &mut self,
        target: InsnHandle,
        targeter: Targeter,
    ) -> Result<(), Error> {
        self.node_mut(target)?.targeters.insert(targeter);
        Ok(())
    }

    pub(super) fn remove_targeter(&mut self, target: InsnHandle, targeter: &Targeter) {
        if let Ok(node) = self.node_mut(target) {
            node.targeters.remove(targeter);
        }
    }

    fn insert_after_position(
        &mut self,
        prev: Option<InsnHandle>,
        insn: ListInstruction,
    ) -> Result<InsnHandle, Error> {
        self.check_targets(&insn)?;
        let handle = self.allocate(insn);
        self.link_after(handle, prev)?;
        self.register_branch(handle)?;
        Ok(handle)
    }

    /// Add an instruction at the end of the list
    pub fn append(&mut self, insn: impl Into<ListInstruction>) -> Result<InsnHandle, Error> {
        let last = self.last;
        self.insert_after_position(last, insn.into())
    }

    /// Add an instruction at the start of the list
    pub fn insert(&mut self, insn: impl Into<ListInstruction>) -> Result<InsnHandle, Error> {
        self.insert_after_position(None, insn.into())
    }

    pub fn append_after(
        &mut self,
        handle: InsnHandle,
        insn: impl Into<ListInstruction>,
    ) -> Result<InsnHandle, Error> {
        self.linked(handle)?;
        self.insert_after_position(Some(handle), insn.into())
    }

    pub fn insert_before(
        &mut self,
        handle: InsnHandle,
        insn: impl Into<ListInstruction>,
    ) -> Result<InsnHandle, Error> {
        let prev = self.linked(handle)?.prev;
        self.insert_after_position(prev, insn.into())
    }

    /// Move all of the instructions of `other` to the end of this list
    ///
    /// `other` is left empty. Jumps between instructions of `other` are remapped to the new
    /// handles, which are returned (keyed by the old handles).
    pub fn append_list(&mut self, other: &mut InstructionList) -> Result<HandleMap, Error> {
        let last = self.last;
        self.splice_after(last, other)
    }

    /// Move all of the instructions of `other` to the start of this list
    pub fn insert_list(&mut self, other: &mut InstructionList) -> Result<HandleMap, Error> {
        self.splice_after(None, other)
    }

    pub fn append_list_after(
        &mut self,
        handle: InsnHandle,
        other: &mut InstructionList,
    ) -> Result<HandleMap, Error> {
        self.linked(handle)?;
        self.splice_after(Some(handle), other)
    }

    pub fn insert_list_before(
        &mut self,
        handle: InsnHandle,
        other: &mut InstructionList,
    ) -> Result<HandleMap, Error> {
        let prev = self.linked(handle)?.prev;
        self.splice_after(prev, other)
    }

    /// Every linked branch of `self` targets a linked instruction of `self`
    fn check_closed(&self) -> Result<(), Error> {
        for handle in self.iter() {
            for target in self.node(handle)?.jump_targets() {
                if !self.contains(target) {
                    return Err(Error::TargetNotInList {
                        targeter: Targeter::Branch(handle),
                        target,
                    });
                }
            }
        }
        Ok(())
    }

    /// Clone every instruction of `other` into fresh nodes linked after `prev`
    ///
    /// Branch targets are remapped and registered. Non-branch targeters are carried over when
    /// `keep_records` is set (the records then need remapping with the returned map).
    fn clone_nodes_after(
        &mut self,
        mut prev: Option<InsnHandle>,
        other: &InstructionList,
        keep_records: bool,
    ) -> Result<HandleMap, Error> {
        other.check_closed()?;

        // Pass 1: allocate and link, building the translation table
        let mut map = HandleMap::new();
        for old_handle in other.iter() {
            let old_node = other.node(old_handle)?;
            let new_handle = self.allocate(old_node.insn.clone());
            let new_node = self.node_mut(new_handle)?;
            new_node.wide = old_node.wide;
            new_node.encoding = old_node.encoding;
            if keep_records {
                new_node.targeters = old_node
                    .targeters
                    .iter()
                    .filter(|targeter| !targeter.is_branch())
                    .copied()
                    .collect();
            }
            self.link_after(new_handle, prev)?;
            map.insert(old_handle, new_handle);
            prev = Some(new_handle);
        }

        // Pass 2: rewrite the jump targets through the table
        for new_handle in map.values().copied() {
            let node = self.node_mut(new_handle)?;
            if let ListInstruction::Branch(branch) = &node.insn {
                let remapped: BranchInstruction<InsnHandle> =
                    branch.map_labels(|target| map.get(target).copied().unwrap_or(*target));
                node.insn = ListInstruction::Branch(remapped);
            }
        }
        for new_handle in map.values().copied() {
            self.register_branch(new_handle)?;
        }

        Ok(map)
    }

    fn splice_after(
        &mut self,
        prev: Option<InsnHandle>,
        other: &mut InstructionList,
    ) -> Result<HandleMap, Error> {
        if other.is_empty() {
            return Err(Error::EmptyList);
        }
        let map = self.clone_nodes_after(prev, other, true)?;
        log::trace!("Spliced {} instructions from {:?}", map.len(), other.id);
        other.dispose();
        Ok(map)
    }

    /// Deep copy of the list (exception handlers and other records are not copied)
    pub fn copy(&self) -> Result<InstructionList, Error> {
        self.copy_with_map().map(|(copy, _)| copy)
    }

    /// Deep copy of the list, along with the translation from old to new handles
    pub fn copy_with_map(&self) -> Result<(InstructionList, HandleMap), Error> {
        let mut copy = InstructionList::new();
        let map = copy.clone_nodes_after(None, self, false)?;
        Ok((copy, map))
    }

    /// Delete one instruction
    ///
    /// If the handle is already detached (from an earlier deletion which reported
    /// [`Error::TargetLost`]), this disposes of it provided nothing targets it anymore.
    pub fn delete(&mut self, handle: InsnHandle) -> Result<(), Error> {
        let node = self.node(handle)?;
        if node.attached {
            return self.delete_range(handle, handle);
        }
        if node.targeters.is_empty() {
            self.unregister_branch(handle);
            self.release(handle);
            Ok(())
        } else {
            Err(Error::TargetLost(vec![handle]))
        }
    }

    /// Delete the instructions from `start` to `end` (inclusive)
    ///
    /// The whole range is always unlinked. Instructions still targeted by something outside the
    /// range are kept detached (but not disposed) and reported in [`Error::TargetLost`].
    pub fn delete_range(&mut self, start: InsnHandle, end: InsnHandle) -> Result<(), Error> {
        let handles = self.range_handles(start, end)?;
        self.unlink_chain(start, end, handles.len())?;

        for handle in &handles {
            self.node_mut(*handle)?.attached = false;
        }
        for handle in &handles {
            self.unregister_branch(*handle);
        }

        let mut lost = vec![];
        for handle in handles {
            if self.node(handle)?.targeters.is_empty() {
                self.release(handle);
            } else {
                lost.push(handle);
            }
        }

        if lost.is_empty() {
            Ok(())
        } else {
            log::debug!("Deleted instructions are still targeted: {:?}", lost);
            Err(Error::TargetLost(lost))
        }
    }

    /// Move the instructions from `start` to `end` (inclusive) after `target`
    ///
    /// With no target, the range is moved to the start of the list.
    pub fn move_range(
        &mut self,
        start: InsnHandle,
        end: InsnHandle,
        target: Option<InsnHandle>,
    ) -> Result<(), Error> {
        let handles = self.range_handles(start, end)?;
        if let Some(target) = target {
            self.linked(target)?;
            if handles.contains(&target) {
                return Err(Error::MoveIntoRange(target));
            }
        }
        self.unlink_chain(start, end, handles.len())?;
        self.link_chain_after(start, end, handles.len(), target)
    }

    /// Replace the instruction behind a handle, returning the previous one
    ///
    /// Branch handles can only hold branch instructions and vice versa.
    pub fn set_instruction(
        &mut self,
        handle: InsnHandle,
        insn: impl Into<ListInstruction>,
    ) -> Result<ListInstruction, Error> {
        let insn = insn.into();
        let node = self.linked(handle)?;
        if node.is_branch != insn.is_branch() {
            return Err(Error::HandleKindMismatch {
                handle,
                branch: node.is_branch,
            });
        }
        self.check_targets(&insn)?;

        self.unregister_branch(handle);
        let node = self.node_mut(handle)?;
        let old_insn = std::mem::replace(&mut node.insn, insn);
        node.wide = false;
        node.encoding = Encoding::Shortest;
        self.register_branch(handle)?;
        self.layout = None;
        Ok(old_insn)
    }

    /// Make a branch instruction jump to `new` wherever it used to jump to `old`
    pub fn set_target(
        &mut self,
        branch: InsnHandle,
        old: InsnHandle,
        new: InsnHandle,
    ) -> Result<(), Error> {
        self.node(new)?;
        let changed = match &mut self.node_mut(branch)?.insn {
            ListInstruction::Branch(insn) => insn.replace_target(old, new),
            ListInstruction::Straight(_) => false,
        };
        if !changed {
            return Err(Error::NotATargeter(branch));
        }
        self.remove_targeter(old, &Targeter::Branch(branch));
        self.add_targeter(new, Targeter::Branch(branch))?;
        self.layout = None;
        Ok(())
    }

    /// Make every branch jumping to `old` jump to `new` instead
    pub fn redirect_branches(&mut self, old: InsnHandle, new: InsnHandle) -> Result<(), Error> {
        if old == new {
            return Ok(());
        }
        self.node(new)?;
        let branches: Vec<InsnHandle> = self
            .node(old)?
            .targeters
            .iter()
            .filter_map(|targeter| match targeter {
                Targeter::Branch(branch) => Some(*branch),
                _ => None,
            })
            .collect();
        for branch in branches {
            self.set_target(branch, old, new)?;
        }
        Ok(())
    }

    /// Dispose of every instruction, leaving the list empty
    ///
    /// All outstanding handles (including detached ones) become invalid.
    pub fn dispose(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.node.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.first = None;
        self.last = None;
        self.len = 0;
        self.layout = None;
    }
}

impl Default for InstructionList {
    fn default() -> Self {
        InstructionList::new()
    }
}

impl Debug for InstructionList {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.instructions()).finish()
    }
}

/// Iterator over the handles of a list
pub struct Handles<'a> {
    list: &'a InstructionList,
    next: Option<InsnHandle>,
}

impl<'a> Iterator for Handles<'a> {
    type Item = InsnHandle;

    fn next(&mut self) -> Option<InsnHandle> {
        let current = self.next?;
        self.next = self.list.node(current).ok().and_then(|node| node.next);
        Some(current)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::{BranchInstruction, Instruction, OrdComparison};

    fn assert_linked(list: &InstructionList) {
        let handles: Vec<InsnHandle> = list.iter().collect();
        assert_eq!(handles.len(), list.len());
        assert_eq!(list.first(), handles.first().copied());
        assert_eq!(list.last(), handles.last().copied());
        for window in handles.windows(2) {
            assert_eq!(list.next(window[0]).unwrap(), Some(window[1]));
            assert_eq!(list.prev(window[1]).unwrap(), Some(window[0]));
        }
        if let Some(first) = list.first() {
            assert_eq!(list.prev(first).unwrap(), None);
        }
        if let Some(last) = list.last() {
            assert_eq!(list.next(last).unwrap(), None);
        }
    }

    fn straight(list: &InstructionList) -> Vec<Instruction> {
        list.instructions()
            .filter_map(|(_, insn)| insn.as_straight().cloned())
            .collect()
    }

    #[test]
    fn insertion_positions() {
        let mut list = InstructionList::new();
        let b = list.append(Instruction::IConst2).unwrap();
        let a = list.insert(Instruction::IConst1).unwrap();
        let d = list.append(Instruction::IConst4).unwrap();
        list.append_after(b, Instruction::IConst3).unwrap();
        list.insert_before(a, Instruction::IConst0).unwrap();
        list.insert_before(d, Instruction::Nop).unwrap();
        assert_linked(&list);
        assert_eq!(
            straight(&list),
            vec![
                Instruction::IConst0,
                Instruction::IConst1,
                Instruction::IConst2,
                Instruction::IConst3,
                Instruction::Nop,
                Instruction::IConst4,
            ]
        );
    }

    #[test]
    fn handles_are_kind_checked() {
        let mut list = InstructionList::new();
        let nop = list.append(Instruction::Nop).unwrap();
        let ret = list.append(BranchInstruction::Return).unwrap();
        assert!(matches!(
            list.set_instruction(nop, BranchInstruction::Return),
            Err(Error::HandleKindMismatch { branch: false, .. })
        ));
        assert!(matches!(
            list.set_instruction(ret, Instruction::Nop),
            Err(Error::HandleKindMismatch { branch: true, .. })
        ));
        assert_eq!(
            list.set_instruction(nop, Instruction::IConst0).unwrap(),
            ListInstruction::Straight(Instruction::Nop)
        );
    }

    #[test]
    fn stale_and_foreign_handles() {
        let mut list = InstructionList::new();
        let mut other = InstructionList::new();
        let nop = list.append(Instruction::Nop).unwrap();
        let foreign = other.append(Instruction::Nop).unwrap();
        assert!(matches!(list.get(foreign), Err(Error::InvalidHandle(_))));

        list.delete(nop).unwrap();
        assert!(matches!(list.get(nop), Err(Error::InvalidHandle(_))));

        // The slot gets recycled, but the old handle stays invalid
        let reused = list.append(Instruction::Pop).unwrap();
        assert_ne!(reused, nop);
        assert!(matches!(list.get(nop), Err(Error::InvalidHandle(_))));
        assert!(list.get(reused).is_ok());
    }

    #[test]
    fn branch_targets_are_tracked() {
        let mut list = InstructionList::new();
        let target = list.append(Instruction::IConst0).unwrap();
        let other = list.append(Instruction::IConst1).unwrap();
        let jump = list
            .append(BranchInstruction::If(OrdComparison::EQ, target))
            .unwrap();
        assert!(list.targeters(target).unwrap().contains(&Targeter::Branch(jump)));

        list.set_target(jump, target, other).unwrap();
        assert!(list.targeters(target).unwrap().is_empty());
        assert!(list.targeters(other).unwrap().contains(&Targeter::Branch(jump)));
        assert!(matches!(
            list.set_target(jump, target, other),
            Err(Error::NotATargeter(_))
        ));

        // Deleting the branch releases its target
        list.delete(jump).unwrap();
        assert!(list.targeters(other).unwrap().is_empty());
    }

    #[test]
    fn delete_range_reports_lost_targets() {
        let mut list = InstructionList::new();
        let a = list.append(Instruction::IConst0).unwrap();
        let b = list.append(Instruction::IConst1).unwrap();
        let c = list.append(BranchInstruction::Goto(a)).unwrap();
        let d = list.append(BranchInstruction::Goto(b)).unwrap();

        // `b` is targeted from outside the range, `a` only from inside
        match list.delete_range(a, c) {
            Err(Error::TargetLost(lost)) => assert_eq!(lost, vec![b]),
            other => panic!("unexpected result {:?}", other),
        }
        assert_linked(&list);
        assert_eq!(list.len(), 1);
        assert!(!list.contains(b));
        assert!(list.get(b).is_ok(), "detached handle is not disposed");
        assert!(list.get(a).is_err());
        assert!(list.get(c).is_err());

        list.set_target(d, b, d).unwrap();
        list.delete(b).unwrap();
        assert!(list.get(b).is_err());
        assert!(list.targeters(d).unwrap().contains(&Targeter::Branch(d)));
    }

    #[test]
    fn move_ranges() {
        let mut list = InstructionList::new();
        let handles: Vec<InsnHandle> = [
            Instruction::IConst0,
            Instruction::IConst1,
            Instruction::IConst2,
            Instruction::IConst3,
        ]
        .into_iter()
        .map(|insn| list.append(insn).unwrap())
        .collect();

        list.move_range(handles[0], handles[1], Some(handles[3])).unwrap();
        assert_linked(&list);
        assert_eq!(
            straight(&list),
            vec![
                Instruction::IConst2,
                Instruction::IConst3,
                Instruction::IConst0,
                Instruction::IConst1,
            ]
        );

        list.move_range(handles[0], handles[1], None).unwrap();
        assert_linked(&list);
        assert_eq!(list.first(), Some(handles[0]));

        assert!(matches!(
            list.move_range(handles[0], handles[2], Some(handles[1])),
            Err(Error::MoveIntoRange(_))
        ));
        assert!(matches!(
            list.move_range(handles[2], handles[0], None),
            Err(Error::InvalidRange { .. })
        ));
    }

    #[test]
    fn splicing_empties_the_source() {
        let mut list = InstructionList::new();
        let first = list.append(Instruction::IConst0).unwrap();
        list.append(BranchInstruction::IReturn).unwrap();

        let mut other = InstructionList::new();
        let loop_start = other.append(Instruction::Nop).unwrap();
        let jump = other.append(BranchInstruction::Goto(loop_start)).unwrap();

        let map = list.append_list_after(first, &mut other).unwrap();
        assert!(other.is_empty());
        assert!(other.get(loop_start).is_err());
        assert_linked(&list);
        assert_eq!(list.len(), 4);

        let new_jump = map[&jump];
        let new_start = map[&loop_start];
        assert_eq!(
            list.get(new_jump).unwrap(),
            &ListInstruction::Branch(BranchInstruction::Goto(new_start))
        );
        assert!(list.targeters(new_start).unwrap().contains(&Targeter::Branch(new_jump)));

        assert!(matches!(list.append_list(&mut other), Err(Error::EmptyList)));
    }
}
