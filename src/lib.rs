//! Mutable JVM method bodies
//!
//! The [`jvm::code::InstructionList`] is the centerpiece: a doubly-linked list of bytecode
//! instructions which can be freely edited (spliced, moved, copied, deleted) while keeping track
//! of everything that points into it (branches, exception handlers, local variable scopes, line
//! numbers). Once editing is done, [`jvm::code::MethodCode::generate`] lays out the instructions,
//! picks jump encodings, and infers a `StackMapTable`.

pub mod jvm;
pub mod util;
