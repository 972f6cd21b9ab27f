use super::class_file::{Constant, ConstantIndex, ConstantPoolOverflow};
use super::code::{InsnHandle, Targeter};
use super::verifier::VerificationType;
use super::RefType;
use crate::util::Offset;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Some of the deleted instructions are still targeted
    ///
    /// This is the one recoverable error: the listed handles are detached from the list but not
    /// disposed. Redirect whatever targets them (eg. with
    /// [`crate::jvm::code::InstructionList::redirect_branches`]) and delete them again.
    #[error("deleted instructions are still targeted: {0:?}")]
    TargetLost(Vec<InsnHandle>),

    /// Handle is from another list, or its instruction has been disposed
    #[error("invalid instruction handle {0:?}")]
    InvalidHandle(InsnHandle),

    /// Handle is not linked into the list (it was detached by a deletion)
    #[error("instruction handle {0:?} is not in the list")]
    DetachedHandle(InsnHandle),

    /// Branch handles only ever hold branch instructions, and vice versa
    #[error("{handle:?} cannot hold this instruction (branch handle: {branch})")]
    HandleKindMismatch { handle: InsnHandle, branch: bool },

    #[error("cannot splice in an empty instruction list")]
    EmptyList,

    /// The range end is not reachable from the range start
    #[error("invalid instruction range from {start:?} to {end:?}")]
    InvalidRange { start: InsnHandle, end: InsnHandle },

    #[error("cannot move a range after {0:?}, which is inside the range")]
    MoveIntoRange(InsnHandle),

    /// A reference points to an instruction which is not linked into the list
    #[error("{targeter:?} targets {target:?}, which is not in the list")]
    TargetNotInList {
        targeter: Targeter,
        target: InsnHandle,
    },

    #[error("{0:?} is not a branch instruction targeting that instruction")]
    NotATargeter(InsnHandle),

    #[error("instruction positions have not been resolved")]
    PositionsNotResolved,

    #[error("method code is {0:?} bytes long, which is too large")]
    MethodCodeOverflow(Offset),

    #[error("maximum stack depth overflowed at {0:?}")]
    MethodCodeMaxStackOverflow(Offset),

    #[error("maximum number of locals overflowed at {0:?}")]
    MethodCodeMaxLocalsOverflow(Offset),

    #[error("jump from {0:?} does not fit in its encoding")]
    BranchOffsetOverflow(InsnHandle),

    #[error("unknown opcode {opcode:#04x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },

    /// `jsr`, `jsr_w`, and `ret` are deliberately not modelled
    #[error("unsupported opcode {opcode:#04x} at offset {offset}")]
    UnsupportedOpcode { opcode: u8, offset: usize },

    #[error("code array ends in the middle of the instruction at offset {0}")]
    TruncatedCode(usize),

    #[error("malformed instruction at offset {offset}: {message}")]
    MalformedInstruction { offset: usize, message: String },

    #[error("jump at offset {offset} lands on {target}, which is not the start of an instruction")]
    InvalidBranchTarget { offset: usize, target: isize },

    #[error("exception range {start_pc}..{end_pc} -> {handler_pc} splits an instruction")]
    InvalidExceptionRange {
        start_pc: u16,
        end_pc: u16,
        handler_pc: u16,
    },

    #[error("duplicate switch key {0}")]
    DuplicateSwitchKey(i32),

    #[error("switch has {keys} keys but {targets} targets")]
    MismatchedSwitchTargets { keys: usize, targets: usize },

    #[error("constant pool overflow while adding {constant:?} at {offset}")]
    ConstantPoolOverflow { constant: Constant, offset: u16 },

    #[error("bad descriptor {0:?}")]
    BadDescriptor(String),

    /// Error while inferring the frame of an instruction
    #[error("verifier error at {handle:?} ({offset:?}): {kind}")]
    VerifierError {
        handle: InsnHandle,
        offset: Offset,
        kind: VerifierErrorKind,
    },

    /// Two control flow paths reach a block with incompatible frames
    #[error("incompatible frames entering the block at {offset:?}: {kind}")]
    IncompatibleFrames {
        offset: Offset,
        kind: VerifierErrorKind,
    },

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl From<ConstantPoolOverflow> for Error {
    fn from(overflow: ConstantPoolOverflow) -> Error {
        Error::ConstantPoolOverflow {
            constant: overflow.constant,
            offset: overflow.offset,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifierErrorKind {
    #[error("pop from an empty stack")]
    EmptyStack,

    #[error("unexpected value of width {0}")]
    InvalidWidth(usize),

    #[error("expected an array type")]
    NotArrayType,

    #[error("invalid local variable index {0}")]
    InvalidIndex(u16),

    #[error("invalid type")]
    InvalidType,

    #[error("constant {0:?} is missing or has the wrong kind")]
    MissingConstant(ConstantIndex),

    #[error("constant {0:?} cannot be loaded with this instruction")]
    NotLoadableConstant(ConstantIndex),

    #[error("bad descriptor {0:?}")]
    BadDescriptor(String),

    #[error("incompatible types {0:?} and {1:?}")]
    IncompatibleStack(
        VerificationType<RefType, InsnHandle>,
        VerificationType<RefType, InsnHandle>,
    ),

    #[error("stack heights {0} and {1} do not match")]
    StackHeightMismatch(usize, usize),

    #[error("execution falls off the end of the code")]
    FallsOffEnd,
}
