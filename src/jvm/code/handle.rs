use std::fmt::{Debug, Formatter, Result};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Identifier of an [`crate::jvm::code::InstructionList`]
///
/// Identifiers are never reused, so a handle can always tell which list it came from.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ListId(u32);

static NEXT_LIST_ID: AtomicU32 = AtomicU32::new(0);

impl ListId {
    pub(super) fn fresh() -> ListId {
        ListId(NEXT_LIST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Reference to one instruction inside an instruction list
///
/// A handle is a plain index into the arena of the list that created it. The generation makes
/// stale handles (whose instruction has been disposed and whose slot may have been reused)
/// detectable instead of silently aliasing a new instruction.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InsnHandle {
    pub(super) list: ListId,
    pub(super) index: u32,
    pub(super) generation: u32,
}

impl InsnHandle {
    /// List which owns the instruction
    pub fn list_id(&self) -> ListId {
        self.list
    }
}

impl Debug for InsnHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "insn#{}.{}@{}", self.index, self.generation, self.list.0)
    }
}

/// Identity of a targeter record which is not itself an instruction
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct TargeterId(u64);

static NEXT_TARGETER_ID: AtomicU64 = AtomicU64::new(0);

impl TargeterId {
    pub(super) fn fresh() -> TargeterId {
        TargeterId(NEXT_TARGETER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Something holding a reference to an instruction
///
/// Every instruction keeps the set of its targeters, so that anything pointing at it can be found
/// (and redirected) before it gets deleted.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Targeter {
    /// Jump or switch instruction
    Branch(InsnHandle),

    /// Exception handler (start, end, or handler entry)
    ExceptionHandler(TargeterId),

    /// Scope of a local variable (start or end)
    LocalVariable(TargeterId),

    /// Line number entry
    LineNumber(TargeterId),
}

impl Targeter {
    pub fn is_branch(&self) -> bool {
        matches!(self, Targeter::Branch(_))
    }
}
