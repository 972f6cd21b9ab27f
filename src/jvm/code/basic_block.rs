//! Partitioning a resolved instruction list into basic blocks
//!
//! A block starts at the first instruction, at every instruction something targets (jumps,
//! exception handlers, local variable scopes, line numbers), right after every branch, and right
//! after the end of every protected range. It then runs until the next block start. Since every
//! [`super::BranchInstruction`] (including returns and `athrow`) starts a new block after it,
//! control only ever leaves a block through its last instruction, or through an exception.

use super::{
    ExceptionHandler, InsnHandle, InstructionList, InstructionTargeter, ListInstruction, Targeter,
};
use crate::jvm::{Error, VerifierErrorKind};
use crate::util::Offset;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    /// First instruction in the block
    pub start: InsnHandle,

    /// Last instruction in the block
    pub end: InsnHandle,

    /// Byte offset of the first instruction
    pub offset: Offset,

    /// Byte offset just past the last instruction
    pub end_offset: Offset,

    pub instructions: Vec<InsnHandle>,

    /// Blocks to which control can flow normally (branch targets and fall through)
    pub successors: Vec<usize>,

    /// Exception handlers (indices into the handlers given for partitioning) protecting some
    /// instruction in the block
    pub handlers: Vec<usize>,
}

impl BasicBlock {
    fn new(start: InsnHandle, offset: Offset) -> BasicBlock {
        BasicBlock {
            start,
            end: start,
            offset,
            end_offset: offset,
            instructions: vec![],
            successors: vec![],
            handlers: vec![],
        }
    }
}

/// Blocks of a method body, in list order
#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    pub blocks: Vec<BasicBlock>,

    /// Block of every instruction
    block_of: HashMap<InsnHandle, usize>,
}

impl ControlFlowGraph {
    /// Partition a list (which must have resolved positions)
    pub fn partition(
        list: &InstructionList,
        handlers: &[ExceptionHandler],
    ) -> Result<ControlFlowGraph, Error> {
        if !list.is_resolved() {
            return Err(Error::PositionsNotResolved);
        }

        let mut starts: HashSet<InsnHandle> = list.first().into_iter().collect();
        for handle in list.iter() {
            let node = list.linked(handle)?;
            if !node.targeters.is_empty() {
                starts.insert(handle);
            }
            if node.is_branch {
                starts.extend(node.next);
            }
        }
        for handler in handlers {
            for target in [handler.start(), handler.end(), handler.handler()] {
                if !list.contains(target) {
                    return Err(Error::TargetNotInList {
                        targeter: handler.targeter(),
                        target,
                    });
                }
            }
            starts.insert(handler.start());
            starts.insert(handler.handler());
            starts.extend(list.next(handler.end())?);
        }

        // Cut the list into blocks
        let mut blocks: Vec<BasicBlock> = vec![];
        let mut block_of = HashMap::new();
        for handle in list.iter() {
            let offset = list.position(handle)?;
            if blocks.is_empty() || starts.contains(&handle) {
                blocks.push(BasicBlock::new(handle, offset));
            }
            let index = blocks.len() - 1;
            let block = &mut blocks[index];
            block.instructions.push(handle);
            block.end = handle;
            block.end_offset = list.end_position(handle)?;
            block_of.insert(handle, index);
        }

        // Normal edges
        let block_count = blocks.len();
        for (index, block) in blocks.iter_mut().enumerate() {
            let last = block.end;
            let falls_through = match &list.linked(last)?.insn {
                ListInstruction::Straight(_) => true,
                ListInstruction::Branch(branch) => {
                    for target in branch.jump_targets() {
                        let successor =
                            *block_of.get(target).ok_or(Error::TargetNotInList {
                                targeter: Targeter::Branch(last),
                                target: *target,
                            })?;
                        if !block.successors.contains(&successor) {
                            block.successors.push(successor);
                        }
                    }
                    branch.falls_through()
                }
            };
            if falls_through {
                if index + 1 == block_count {
                    return Err(Error::VerifierError {
                        handle: last,
                        offset: list.position(last)?,
                        kind: VerifierErrorKind::FallsOffEnd,
                    });
                }
                if !block.successors.contains(&(index + 1)) {
                    block.successors.push(index + 1);
                }
            }
        }

        // Exceptional edges
        for (handler_index, handler) in handlers.iter().enumerate() {
            let start = list.position(handler.start())?;
            let end = list.end_position(handler.end())?;
            for block in blocks.iter_mut() {
                if block.offset < end && start < block.end_offset {
                    block.handlers.push(handler_index);
                }
            }
        }

        log::trace!(
            "Partitioned {} instructions into {} blocks",
            list.len(),
            blocks.len()
        );
        Ok(ControlFlowGraph { blocks, block_of })
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Index of the block containing an instruction
    pub fn block_index(&self, handle: InsnHandle) -> Option<usize> {
        self.block_of.get(&handle).copied()
    }

    /// Index of the block starting at an instruction
    pub fn block_starting_at(&self, handle: InsnHandle) -> Option<usize> {
        self.block_index(handle)
            .filter(|index| self.blocks[*index].start == handle)
    }

    /// Blocks from which control can flow normally into the given block
    pub fn predecessors(&self, index: usize) -> Vec<usize> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, block)| block.successors.contains(&index))
            .map(|(predecessor, _)| predecessor)
            .collect()
    }
}
