//! This module is responsible for laying out an instruction list: picking the final encoding of
//! every jump and assigning byte offsets. Most jumps use a signed 16-bit relative offset, so
//! jumps which end up further than that need a wider encoding:
//!
//! ```text,ignore,no_run
//!     goto L           =>    goto_w L
//!
//!     if* L            =>    ifnot* +8
//!                            goto_w L
//! ```
//!
//! ### Termination
//!
//! This is a tricky problem because the wide encodings are themselves longer, so widening one jump
//! risks pushing other jumps out of range. Instead of iterating to a fixpoint, layout happens in
//! three passes:
//!
//!   1. tentative offsets are computed with the current encodings, along with an upper bound on
//!      how much the code could still grow (`goto` grows by 2, a conditional by 5, and switch
//!      padding by up to 3 bytes)
//!
//!   2. in a single sweep, every short jump whose tentative displacement comes within that upper
//!      bound of the 16-bit limit is widened. Since the final displacement can't differ from the
//!      tentative one by more than the bound, the jumps not widened are guaranteed to fit
//!
//!   3. final offsets are assigned using the widths picked in pass 2
//!
//! Widening decisions stick to the instruction, so laying out an unchanged list again produces
//! exactly the same offsets.

use super::{
    BranchInstruction, Encoding, InsnHandle, InstructionList, ListInstruction, Placed, Targeter,
};
use crate::jvm::Error;
use crate::util::{Offset, OffsetVec};
use std::convert::TryFrom;

/// Maximum length of the code array of a method
pub const MAX_CODE_LENGTH: usize = u16::MAX as usize;

impl InstructionList {
    /// Encoded width of an instruction placed at `offset`
    fn width_at(&self, handle: InsnHandle, offset: usize) -> Result<usize, Error> {
        let node = self.node(handle)?;
        Ok(match &node.insn {
            ListInstruction::Straight(insn) => insn.width_in(node.encoding),
            ListInstruction::Branch(branch) => branch.width_at(offset, node.wide),
        })
    }

    /// Assign byte offsets to every instruction and settle jump encodings
    ///
    /// With `check` set, every jump target must be linked into this list. Either way, jumps to
    /// instructions that are not in the list will fail to encode.
    pub fn set_positions(&mut self, check: bool) -> Result<(), Error> {
        let handles: Vec<InsnHandle> = self.iter().collect();

        // Pass 1: tentative offsets and the bound on growth
        let mut offset = 0;
        let mut max_growth = 0;
        for handle in &handles {
            let width = self.width_at(*handle, offset)?;
            let node = self.node_mut(*handle)?;
            node.offset = offset;
            if let ListInstruction::Branch(branch) = &node.insn {
                if !node.wide {
                    max_growth += branch.max_growth();
                }
            }
            offset += width;
        }
        if check {
            for handle in &handles {
                for target in self.node(*handle)?.jump_targets() {
                    if !self.contains(target) {
                        return Err(Error::TargetNotInList {
                            targeter: Targeter::Branch(*handle),
                            target,
                        });
                    }
                }
            }
        }

        // Pass 2: widen short jumps that might not fit (using the tentative offsets)
        let limit = i16::MAX as isize - max_growth as isize;
        let mut widened = 0;
        for handle in &handles {
            let node = self.node(*handle)?;
            let needs_widening = match &node.insn {
                ListInstruction::Branch(branch)
                    if !node.wide && branch.has_short_displacement() =>
                {
                    let from = node.offset as isize;
                    branch.jump_targets().into_iter().any(|target| {
                        self.node(*target)
                            .map(|target| (target.offset as isize - from).abs() >= limit)
                            .unwrap_or(false)
                    })
                }
                _ => false,
            };
            if needs_widening {
                self.node_mut(*handle)?.wide = true;
                widened += 1;
            }
        }

        // Pass 3: final offsets
        let mut layout = OffsetVec::new();
        for handle in &handles {
            let offset = layout.offset_len().0;
            let width = self.width_at(*handle, offset)?;
            let node = self.node_mut(*handle)?;
            node.offset = offset;
            node.width = width;
            layout.push(Placed {
                handle: *handle,
                width,
            });
        }

        let code_length = layout.offset_len();
        if code_length.0 > MAX_CODE_LENGTH {
            return Err(Error::MethodCodeOverflow(code_length));
        }
        log::trace!(
            "Laid out {} instructions in {} bytes ({} jumps widened)",
            handles.len(),
            code_length.0,
            widened
        );
        self.layout = Some(layout);
        Ok(())
    }

    /// Instruction starting at a byte offset (requires resolved positions)
    pub fn find_by_offset(&self, offset: usize) -> Option<InsnHandle> {
        self.layout
            .as_ref()
            .and_then(|layout| layout.get_offset(Offset(offset)).ok())
            .map(|placed| placed.handle)
    }

    /// Has this (short) jump been widened during layout?
    pub fn is_widened(&self, handle: InsnHandle) -> Result<bool, Error> {
        Ok(self.node(handle)?.wide)
    }

    /// Encoding used for a straight instruction
    pub fn encoding(&self, handle: InsnHandle) -> Result<Encoding, Error> {
        Ok(self.node(handle)?.encoding)
    }

    /// Pick the encoding of a straight instruction
    ///
    /// Replacing the instruction resets its encoding to [`Encoding::Shortest`].
    pub fn set_encoding(&mut self, handle: InsnHandle, encoding: Encoding) -> Result<(), Error> {
        self.linked(handle)?;
        self.node_mut(handle)?.encoding = encoding;
        self.layout = None;
        Ok(())
    }

    /// Encode the list into a code array, laying it out first if needed
    pub fn to_bytes(&mut self) -> Result<Vec<u8>, Error> {
        if self.layout.is_none() {
            self.set_positions(true)?;
        }
        self.encode()
    }

    /// Encode the list into a code array (requires resolved positions)
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let code_length = self.code_length()?;
        let mut bytes = Vec::with_capacity(code_length.0);
        for handle in self.iter() {
            let node = self.node(handle)?;
            match &node.insn {
                ListInstruction::Straight(insn) => insn.serialize_in(node.encoding, &mut bytes)?,
                ListInstruction::Branch(branch) => {
                    let relative = self.relative_branch(handle, branch)?;
                    if !node.wide && relative.has_short_displacement() {
                        let fits = relative
                            .jump_targets()
                            .into_iter()
                            .all(|displacement| i16::try_from(*displacement).is_ok());
                        if !fits {
                            return Err(Error::BranchOffsetOverflow(handle));
                        }
                    }
                    relative.serialize_at(node.offset, node.wide, &mut bytes)?;
                }
            }
        }
        Ok(bytes)
    }

    /// Branch with its targets turned into displacements from the branch
    fn relative_branch(
        &self,
        handle: InsnHandle,
        branch: &BranchInstruction<InsnHandle>,
    ) -> Result<BranchInstruction<i32>, Error> {
        let from = self.node(handle)?.offset as isize;
        branch.try_map_labels(|target| {
            let target_node = self.linked(*target).map_err(|_| Error::TargetNotInList {
                targeter: Targeter::Branch(handle),
                target: *target,
            })?;
            i32::try_from(target_node.offset as isize - from)
                .map_err(|_| Error::BranchOffsetOverflow(handle))
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::{Instruction, OrdComparison};

    /// List with a conditional jump over `nops` bytes of filler
    fn jump_over(nops: usize) -> (InstructionList, InsnHandle, InsnHandle) {
        let mut list = InstructionList::new();
        list.append(Instruction::IConst0).unwrap();
        let target = list.append(BranchInstruction::Return).unwrap();
        for _ in 0..nops {
            list.insert_before(target, Instruction::Nop).unwrap();
        }
        let first = list.first().unwrap();
        let jump = list
            .append_after(first, BranchInstruction::If(OrdComparison::EQ, target))
            .unwrap();
        (list, jump, target)
    }

    #[test]
    fn short_jumps_stay_short() {
        let (mut list, jump, target) = jump_over(100);
        list.set_positions(true).unwrap();
        assert!(!list.is_widened(jump).unwrap());
        assert_eq!(list.position(jump).unwrap(), Offset(1));
        assert_eq!(list.position(target).unwrap(), Offset(104));
        assert_eq!(list.find_by_offset(104), Some(target));
        assert_eq!(list.find_by_offset(2), None);
        assert_eq!(list.find_by_offset(105), None);

        let bytes = list.to_bytes().unwrap();
        assert_eq!(&bytes[0..4], &[0x03, 0x99, 0, 103]);
    }

    #[test]
    fn far_jumps_are_widened() {
        let (mut list, jump, target) = jump_over(40000);
        list.set_positions(true).unwrap();
        assert!(list.is_widened(jump).unwrap());
        assert_eq!(list.position(target).unwrap(), Offset(1 + 8 + 40000));

        let bytes = list.to_bytes().unwrap();
        let displacement = (40000 + 8 - 3) as i32;
        let mut expected = vec![0x03, 0x9a, 0, 8, 0xc8];
        expected.extend_from_slice(&displacement.to_be_bytes());
        assert_eq!(&bytes[0..9], expected.as_slice());
    }

    #[test]
    fn resolution_is_idempotent() {
        let (mut list, _, _) = jump_over(32760);
        list.set_positions(true).unwrap();
        let first: Vec<Offset> = list.iter().map(|h| list.position(h).unwrap()).collect();
        list.set_positions(true).unwrap();
        let second: Vec<Offset> = list.iter().map(|h| list.position(h).unwrap()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn mutation_clears_positions() {
        let (mut list, jump, _) = jump_over(3);
        list.set_positions(true).unwrap();
        assert!(list.is_resolved());
        list.append(Instruction::Nop).unwrap();
        assert!(matches!(list.position(jump), Err(Error::PositionsNotResolved)));
        assert_eq!(list.find_by_offset(0), None);
    }

    #[test]
    fn lost_targets_are_caught() {
        let (mut list, _, target) = jump_over(3);
        assert!(matches!(list.delete(target), Err(Error::TargetLost(_))));
        assert!(matches!(
            list.set_positions(true),
            Err(Error::TargetNotInList { .. })
        ));
        list.set_positions(false).unwrap();
        assert!(matches!(list.encode(), Err(Error::TargetNotInList { .. })));
    }
}
