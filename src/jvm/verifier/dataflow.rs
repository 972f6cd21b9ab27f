use super::Frame;
use crate::jvm::class_file::ConstantPool;
use crate::jvm::class_graph::ClassHierarchy;
use crate::jvm::code::{
    ControlFlowGraph, ExceptionHandler, InstructionList, InstructionTargeter, ListInstruction,
};
use crate::jvm::{Error, MethodContext, RefType, VerifierErrorKind};
use crate::util::Offset;
use std::collections::VecDeque;
use std::convert::TryFrom;

/// Result of running frame inference to a fixed point
#[derive(Debug, Clone)]
pub struct InferredFrames {
    /// Frame on entry to each block (`None` for unreachable blocks)
    pub entry_frames: Vec<Option<Frame>>,

    pub max_stack: u16,
    pub max_locals: u16,
}

/// Infer the frame on entry to every block of a method body
///
/// The first block starts with the frame from the method signature. Blocks are then processed
/// from a worklist: a block is simulated instruction by instruction starting from its entry frame,
/// and the resulting frame is merged into the entry frames of its successors. Every instruction
/// covered by an exception handler also merges its locals (with only the exception on the stack)
/// into the handler's block. A block is requeued only when its entry frame changes.
pub fn infer_frames(
    list: &InstructionList,
    cfg: &ControlFlowGraph,
    handlers: &[ExceptionHandler],
    method: &MethodContext,
    constants: &impl ConstantPool,
    hierarchy: &dyn ClassHierarchy,
) -> Result<InferredFrames, Error> {
    let entry = match list.first() {
        None => {
            let frame = Frame::entry(method).map_err(|kind| Error::IncompatibleFrames {
                offset: Offset(0),
                kind,
            })?;
            return Ok(InferredFrames {
                entry_frames: vec![],
                max_stack: 0,
                max_locals: max_u16(frame.locals_len(), Error::MethodCodeMaxLocalsOverflow)?,
            });
        }
        Some(first) => Frame::entry(method).map_err(|kind| Error::VerifierError {
            handle: first,
            offset: Offset(0),
            kind,
        })?,
    };

    let mut inference = Inference {
        cfg,
        hierarchy,
        entry_frames: vec![None; cfg.len()],
        in_worklist: vec![false; cfg.len()],
        worklist: VecDeque::new(),
        max_stack: 0,
        max_locals: entry.locals_len(),
    };
    let handler_types = exception_types(handlers, constants)?;
    let handler_blocks = handlers
        .iter()
        .map(|handler| {
            cfg.block_starting_at(handler.handler())
                .ok_or(Error::TargetNotInList {
                    targeter: handler.targeter(),
                    target: handler.handler(),
                })
        })
        .collect::<Result<Vec<usize>, Error>>()?;

    inference.merge(0, entry)?;
    while let Some(block_index) = inference.worklist.pop_front() {
        inference.in_worklist[block_index] = false;
        let block = &cfg.blocks[block_index];
        let mut frame = match &inference.entry_frames[block_index] {
            Some(frame) => frame.clone(),
            None => continue,
        };
        log::trace!("Simulating block {} at {:?}", block_index, block.offset);

        for handle in &block.instructions {
            let handle = *handle;
            let offset = list.position(handle)?;
            let covering: Vec<usize> = block
                .handlers
                .iter()
                .copied()
                .filter(|index| handlers[*index].covers(list, offset).unwrap_or(false))
                .collect();
            for index in &covering {
                let exception_frame = frame.exception_frame(handler_types[*index].clone());
                inference.merge(handler_blocks[*index], exception_frame)?;
            }

            let locals_before = frame.locals.clone();
            let interpreted = match list.get(handle)? {
                ListInstruction::Straight(insn) => {
                    frame.interpret_instruction(insn, handle, method, constants)
                }
                ListInstruction::Branch(branch) => {
                    frame.interpret_branch_instruction(branch, method)
                }
            };
            interpreted.map_err(|kind| Error::VerifierError {
                handle,
                offset,
                kind,
            })?;
            inference.track_limits(&frame);

            // Stores are visible to the handler if the next instruction throws
            if frame.locals != locals_before {
                for index in &covering {
                    let exception_frame = frame.exception_frame(handler_types[*index].clone());
                    inference.merge(handler_blocks[*index], exception_frame)?;
                }
            }
        }

        for successor in &block.successors {
            inference.merge(*successor, frame.clone())?;
        }
    }

    let reachable = inference
        .entry_frames
        .iter()
        .filter(|frame| frame.is_some())
        .count();
    log::debug!(
        "Inferred frames for {} of {} blocks (max stack {}, max locals {})",
        reachable,
        cfg.len(),
        inference.max_stack,
        inference.max_locals
    );

    Ok(InferredFrames {
        max_stack: max_u16(inference.max_stack, Error::MethodCodeMaxStackOverflow)?,
        max_locals: max_u16(inference.max_locals, Error::MethodCodeMaxLocalsOverflow)?,
        entry_frames: inference.entry_frames,
    })
}

struct Inference<'a> {
    cfg: &'a ControlFlowGraph,
    hierarchy: &'a dyn ClassHierarchy,
    entry_frames: Vec<Option<Frame>>,
    in_worklist: Vec<bool>,
    worklist: VecDeque<usize>,
    max_stack: usize,
    max_locals: usize,
}

impl<'a> Inference<'a> {
    /// Merge a frame into the entry frame of a block, queueing the block if that changed anything
    fn merge(&mut self, block_index: usize, incoming: Frame) -> Result<(), Error> {
        let updated = match &self.entry_frames[block_index] {
            None => incoming,
            Some(existing) => {
                let joined = existing.join(&incoming, self.hierarchy).map_err(|kind| {
                    Error::IncompatibleFrames {
                        offset: self.cfg.blocks[block_index].offset,
                        kind,
                    }
                })?;
                if &joined == existing {
                    return Ok(());
                }
                joined
            }
        };

        self.track_limits(&updated);
        self.entry_frames[block_index] = Some(updated);
        if !self.in_worklist[block_index] {
            self.in_worklist[block_index] = true;
            self.worklist.push_back(block_index);
        }
        Ok(())
    }

    fn track_limits(&mut self, frame: &Frame) {
        self.max_stack = self.max_stack.max(frame.stack.offset_len().0);
        self.max_locals = self.max_locals.max(frame.locals_len());
    }
}

/// Type of the exception on the stack when entering each handler
fn exception_types(
    handlers: &[ExceptionHandler],
    constants: &impl ConstantPool,
) -> Result<Vec<RefType>, Error> {
    handlers
        .iter()
        .map(|handler| match handler.catch_type() {
            None => Ok(RefType::object(RefType::THROWABLE_NAME)),
            Some(index) => {
                let missing = |kind: VerifierErrorKind| Error::VerifierError {
                    handle: handler.handler(),
                    offset: Offset(0),
                    kind,
                };
                let class_name = constants
                    .get_class_name(index)
                    .ok_or_else(|| missing(VerifierErrorKind::MissingConstant(index)))?;
                RefType::from_class_name(class_name).map_err(|_| {
                    missing(VerifierErrorKind::BadDescriptor(class_name.to_owned()))
                })
            }
        })
        .collect()
}

fn max_u16(value: usize, overflow: fn(Offset) -> Error) -> Result<u16, Error> {
    u16::try_from(value).map_err(|_| overflow(Offset(value)))
}
