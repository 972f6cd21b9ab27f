use super::{Frame, InferredFrames, VType, VerificationType};
use crate::jvm::class_file::{ConstantIndex, ConstantPool, StackMapFrame, StackMapTable};
use crate::jvm::code::{ControlFlowGraph, InstructionList};
use crate::jvm::Error;
use crate::util::{Offset, Width};
use std::convert::TryFrom;

/// Build the stack map table of a method body from the inferred frames
///
/// Every reachable block except the one at offset 0 (whose frame is implied by the method
/// signature) gets a `full_frame`. Unreachable blocks are skipped.
pub fn stack_map_table(
    list: &InstructionList,
    cfg: &ControlFlowGraph,
    frames: &InferredFrames,
    constants: &mut impl ConstantPool,
) -> Result<StackMapTable, Error> {
    let mut table = vec![];
    let mut previous_offset: isize = -1;

    for (block, entry_frame) in cfg.blocks.iter().zip(&frames.entry_frames) {
        let frame = match entry_frame {
            Some(frame) => frame,
            None => {
                log::warn!(
                    "Unreachable code at {:?} gets no stack map frame",
                    block.offset
                );
                continue;
            }
        };
        if block.offset.0 == 0 {
            continue;
        }

        let offset_delta = block.offset.0 as isize - previous_offset - 1;
        let offset_delta =
            u16::try_from(offset_delta).map_err(|_| Error::MethodCodeOverflow(block.offset))?;
        previous_offset = block.offset.0 as isize;

        table.push(StackMapFrame {
            offset_delta,
            locals: frame_locals(frame)
                .into_iter()
                .map(|typ| serializable_type(typ, list, constants))
                .collect::<Result<_, Error>>()?,
            stack: frame
                .stack
                .iter()
                .map(|(_, _, typ)| serializable_type(typ, list, constants))
                .collect::<Result<_, Error>>()?,
        });
    }

    log::trace!("Built {} stack map frames", table.len());
    Ok(StackMapTable(table))
}

/// Locals in slot order, with unusable slots as `Top` and trailing `Top`s trimmed
///
/// A `long` or `double` appears once even though it covers two slots.
fn frame_locals(frame: &Frame) -> Vec<&VType> {
    const TOP: &VType = &VerificationType::Top;

    let mut locals = vec![];
    let mut next_slot: u16 = 0;
    for (index, typ) in &frame.locals {
        while next_slot < *index {
            locals.push(TOP);
            next_slot += 1;
        }
        locals.push(typ);
        next_slot = next_slot.saturating_add(typ.width() as u16);
    }
    locals
}

fn serializable_type(
    typ: &VType,
    list: &InstructionList,
    constants: &mut impl ConstantPool,
) -> Result<VerificationType<ConstantIndex, u16>, Error> {
    typ.try_map(
        |ref_type| -> Result<ConstantIndex, Error> {
            Ok(constants.add_class(&ref_type.class_name())?)
        },
        |handle| -> Result<u16, Error> {
            let offset = list.position(*handle)?;
            u16::try_from(offset.0).map_err(|_| Error::MethodCodeOverflow(Offset(offset.0)))
        },
    )
}
