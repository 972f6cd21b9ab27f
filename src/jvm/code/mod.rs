//! Mutable method bodies
//!
//! ### Structure
//!
//! A method body is held in an [`InstructionList`]: a doubly linked sequence of instructions
//! addressed through [`InsnHandle`]s. Instructions are split into two groups:
//!
//!   - [`Instruction`] for straight-line instructions
//!   - [`BranchInstruction`] for instructions that may branch (jumps, switches, returns, `athrow`)
//!
//! Anything that refers to an instruction (branches, but also the [`ExceptionHandler`],
//! [`LocalVariable`], and [`LineNumber`] records owned by the surrounding [`MethodCode`]) is
//! registered as a [`Targeter`] of that instruction. That is what makes it possible to delete
//! instructions without leaving dangling references behind.
//!
//! ### Code generation
//!
//! Turning a list back into a `Code` attribute happens in a few steps:
//!
//!   1. instructions get laid out and jumps get their final encoding (see [`jump_encoding`])
//!   2. the list is cut into [`BasicBlock`]s
//!   3. the frame at the start of every block is inferred (see [`crate::jvm::verifier`])
//!   4. the frames become the [`crate::jvm::class_file::StackMapTable`]
//!
//! [`MethodCode::generate`] does all of those.

mod basic_block;
mod code;
mod decode;
mod handle;
mod instructions;
pub mod jump_encoding;
mod list;
mod switch;
mod targeters;

pub use basic_block::*;
pub use code::*;
pub use handle::*;
pub use instructions::*;
pub use jump_encoding::MAX_CODE_LENGTH;
pub use list::{HandleMap, Handles, InstructionList};
pub use switch::*;
pub use targeters::*;

use list::Placed;
