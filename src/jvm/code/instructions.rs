//! This module contains the AST of JVM bytecode. The representation is slightly different from
//! the usual presentation to make it more convenient to edit bytecode. For instance:
//!
//!   - The "wide" instruction doesn't show up at all, but instead gets merged into the
//!     instructions it is allowed to modify. The same goes for the short forms of loads and
//!     stores (`iload_0`) and for `ldc` vs. `ldc_w`. The shortest encoding is picked from the
//!     operand unless an explicit [`Encoding`] asks for a longer one.
//!
//!   - Some instructions (like the branches) get abstracted into one instruction with a field.
//!     This helps with repetitive pattern matches and also simplifies tasks like inverting a
//!     branch condition.
//!
//!   - Instructions which can transfer control (jumps, switches, returns, `athrow`) live in a
//!     separate [`BranchInstruction`] enum, parametrized over the type of jump targets.
//!
//!   - `jsr`, `jsr_w`, and `ret` are omitted (they cannot appear in class files with stack map
//!     tables anyway).

use crate::jvm::class_file::{ConstantIndex, Serialize};
use crate::jvm::code::InsnHandle;
use crate::jvm::BaseType;
use crate::util::Width;
use byteorder::WriteBytesExt;
use std::convert::{Infallible, TryFrom};
use std::io::{Error, ErrorKind, Result};
use std::ops::Not;

/// Non-branching JVM bytecode instruction
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Instruction {
    Nop,
    AConstNull,
    IConstM1,
    IConst0,
    IConst1,
    IConst2,
    IConst3,
    IConst4,
    IConst5,
    LConst0,
    LConst1,
    FConst0,
    FConst1,
    FConst2,
    DConst0,
    DConst1,
    BiPush(i8),
    SiPush(i16),
    Ldc(ConstantIndex), // covers both `ldc` and `ldc_w`
    Ldc2(ConstantIndex),
    ILoad(u16), // covers `iload`, `iload{0,3}`, and `wide iload`
    LLoad(u16),
    FLoad(u16),
    DLoad(u16),
    ALoad(u16),
    IALoad,
    LALoad,
    FALoad,
    DALoad,
    AALoad,
    BALoad,
    CALoad,
    SALoad,
    IStore(u16), // covers `istore`, `istore{0,3}`, and `wide istore`
    LStore(u16),
    FStore(u16),
    DStore(u16),
    AStore(u16),
    IAStore,
    LAStore,
    FAStore,
    DAStore,
    AAStore,
    BAStore,
    CAStore,
    SAStore,
    Pop,
    Pop2,
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Dup2X1,
    Dup2X2,
    Swap,
    IAdd,
    LAdd,
    FAdd,
    DAdd,
    ISub,
    LSub,
    FSub,
    DSub,
    IMul,
    LMul,
    FMul,
    DMul,
    IDiv,
    LDiv,
    FDiv,
    DDiv,
    IRem,
    LRem,
    FRem,
    DRem,
    INeg,
    LNeg,
    FNeg,
    DNeg,
    ISh(ShiftType), // covers `ishr`, `ishl`, and `iushr`
    LSh(ShiftType), // covers `lshr`, `lshl`, and `lushr`
    IAnd,
    LAnd,
    IOr,
    LOr,
    IXor,
    LXor,
    IInc(u16, i16), // covers `iinc` and `wide iinc`
    I2L,
    I2F,
    I2D,
    L2I,
    L2F,
    L2D,
    F2I,
    F2L,
    F2D,
    D2I,
    D2L,
    D2F,
    I2B,
    I2C,
    I2S,
    LCmp,
    FCmp(CompareMode), // covers `fcmpl` and `fcmpg`
    DCmp(CompareMode), // covers `dcmpl` and `dcmpg`
    GetStatic(ConstantIndex),
    PutStatic(ConstantIndex),
    GetField(ConstantIndex),
    PutField(ConstantIndex),
    Invoke(InvokeType, ConstantIndex),
    InvokeDynamic(ConstantIndex),
    New(ConstantIndex),
    NewArray(BaseType),
    ANewArray(ConstantIndex),
    ArrayLength,
    CheckCast(ConstantIndex),
    InstanceOf(ConstantIndex),
    MonitorEnter,
    MonitorExit,
    MultiANewArray(ConstantIndex, u8),
}

impl Width for Instruction {
    fn width(&self) -> usize {
        match self {
          Instruction::Nop
          | Instruction::AConstNull
          | Instruction::IConstM1
          | Instruction::IConst0
          | Instruction::IConst1
          | Instruction::IConst2
          | Instruction::IConst3
          | Instruction::IConst4
          | Instruction::IConst5
          | Instruction::LConst0
          | Instruction::LConst1
          | Instruction::FConst0
          | Instruction::FConst1
          | Instruction::FConst2
          | Instruction::DConst0
          | Instruction::DConst1
          | Instruction::ILoad(0..=3)
          | Instruction::LLoad(0..=3)
          | Instruction::FLoad(0..=3)
          | Instruction::DLoad(0..=3)
          | Instruction::ALoad(0..=3)
          | Instruction::IALoad
          | Instruction::LALoad
          | Instruction::FALoad
          | Instruction::DALoad
          | Instruction::AALoad
          | Instruction::BALoad
          | Instruction::CALoad
          | Instruction::SALoad
          | Instruction::IStore(0..=3)
          | Instruction::LStore(0..=3)
          | Instruction::FStore(0..=3)
          | Instruction::DStore(0..=3)
          | Instruction::AStore(0..=3)
          | Instruction::IAStore
          | Instruction::LAStore
          | Instruction::FAStore
          | Instruction::DAStore
          | Instruction::AAStore
          | Instruction::BAStore
          | Instruction::CAStore
          | Instruction::SAStore
          | Instruction::Pop
          | Instruction::Pop2
          | Instruction::Dup
          | Instruction::DupX1
          | Instruction::DupX2
          | Instruction::Dup2
          | Instruction::Dup2X1
          | Instruction::Dup2X2
          | Instruction::Swap
          | Instruction::IAdd
          | Instruction::LAdd
          | Instruction::FAdd
          | Instruction::DAdd
          | Instruction::ISub
          | Instruction::LSub
          | Instruction::FSub
          | Instruction::DSub
          | Instruction::IMul
          | Instruction::LMul
          | Instruction::FMul
          | Instruction::DMul
          | Instruction::IDiv
          | Instruction::LDiv
          | Instruction::FDiv
          | Instruction::DDiv
          | Instruction::IRem
          | Instruction::LRem
          | Instruction::FRem
          | Instruction::DRem
          | Instruction::INeg
          | Instruction::LNeg
          | Instruction::FNeg
          | Instruction::DNeg
          | Instruction::ISh(_)
          | Instruction::LSh(_)
          | Instruction::IAnd
          | Instruction::LAnd
          | Instruction::IOr
          | Instruction::LOr
          | Instruction::IXor
          | Instruction::LXor
          | Instruction::I2L
          | Instruction::I2F
          | Instruction::I2D
          | Instruction::L2I
          | Instruction::L2F
          | Instruction::L2D
          | Instruction::F2I
          | Instruction::F2L
          | Instruction::F2D
          | Instruction::D2I
          | Instruction::D2L
          | Instruction::D2F
          | Instruction::I2B
          | Instruction::I2C
          | Instruction::I2S
          | Instruction::LCmp
          | Instruction::FCmp(_)
          | Instruction::DCmp(_)
          | Instruction::ArrayLength
          | Instruction::MonitorEnter
          | Instruction::MonitorExit
          => 1,

          Instruction::BiPush(_)
          | Instruction::ILoad(4..=255)
          | Instruction::LLoad(4..=255)
          | Instruction::FLoad(4..=255)
          | Instruction::DLoad(4..=255)
          | Instruction::ALoad(4..=255)
          | Instruction::IStore(4..=255)
          | Instruction::LStore(4..=255)
          | Instruction::FStore(4..=255)
          | Instruction::DStore(4..=255)
          | Instruction::AStore(4..=255)
          | Instruction::Ldc(ConstantIndex(0..=255))
          | Instruction::NewArray(_)
          => 2,

          Instruction::SiPush(_)
          | Instruction::Ldc(_)
          | Instruction::Ldc2(_) // always wide, unlike `ldc` vs. `ldc_w`
          | Instruction::IInc(0..=255, -128..=127)
          | Instruction::GetStatic(_)
          | Instruction::PutStatic(_)
          | Instruction::GetField(_)
          | Instruction::PutField(_)
          | Instruction::Invoke(InvokeType::Special, _)
          | Instruction::Invoke(InvokeType::Static, _)
          | Instruction::Invoke(InvokeType::Virtual, _)
          | Instruction::New(_)
          | Instruction::ANewArray(_)
          | Instruction::CheckCast(_)
          | Instruction::InstanceOf(_)
          => 3,

          Instruction::ILoad(_)
          | Instruction::LLoad(_)
          | Instruction::FLoad(_)
          | Instruction::DLoad(_)
          | Instruction::ALoad(_)
          | Instruction::IStore(_)
          | Instruction::LStore(_)
          | Instruction::FStore(_)
          | Instruction::DStore(_)
          | Instruction::AStore(_)
          | Instruction::MultiANewArray(_, _)
          => 4,

          Instruction::Invoke(InvokeType::Interface(_), _)
          | Instruction::InvokeDynamic(_)
          => 5,

          Instruction::IInc(_, _)
          => 6,
        }
    }
}

/// Encoding of an instruction which has more than one
///
/// Only local variable accesses and `ldc` have a choice. When the operands don't fit the
/// requested encoding, the shortest one that fits is used instead.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    #[default]
    Shortest,

    /// `iload 1` instead of `iload_1`, `ldc_w` instead of `ldc`
    Explicit,

    /// Prefixed with `wide`
    Wide,
}

impl Instruction {
    /// Opcode of the one byte index form and local variable index of a load or store
    fn local_access(&self) -> Option<(u8, u16)> {
        Some(match self {
            Instruction::ILoad(idx) => (0x15, *idx),
            Instruction::LLoad(idx) => (0x16, *idx),
            Instruction::FLoad(idx) => (0x17, *idx),
            Instruction::DLoad(idx) => (0x18, *idx),
            Instruction::ALoad(idx) => (0x19, *idx),
            Instruction::IStore(idx) => (0x36, *idx),
            Instruction::LStore(idx) => (0x37, *idx),
            Instruction::FStore(idx) => (0x38, *idx),
            Instruction::DStore(idx) => (0x39, *idx),
            Instruction::AStore(idx) => (0x3a, *idx),
            _ => return None,
        })
    }

    /// Encoded width in the given encoding
    pub fn width_in(&self, encoding: Encoding) -> usize {
        match (encoding, self, self.local_access()) {
            (Encoding::Wide, Instruction::IInc(_, _), _) => 6,
            (Encoding::Wide, _, Some(_)) => 4,
            (Encoding::Explicit, Instruction::Ldc(_), _) => 3,
            (Encoding::Explicit, _, Some((_, idx))) if idx <= 0xff => 2,
            _ => self.width(),
        }
    }

    /// Serialize in the given encoding
    pub fn serialize_in<W: WriteBytesExt>(&self, encoding: Encoding, writer: &mut W) -> Result<()> {
        match (encoding, self, self.local_access()) {
            (Encoding::Wide, Instruction::IInc(idx, diff), _) => {
                0xc4u8.serialize(writer)?;
                0x84u8.serialize(writer)?;
                idx.serialize(writer)?;
                diff.serialize(writer)
            }
            (Encoding::Wide, _, Some((opcode, idx))) => {
                0xc4u8.serialize(writer)?;
                opcode.serialize(writer)?;
                idx.serialize(writer)
            }
            (Encoding::Explicit, Instruction::Ldc(idx), _) => {
                0x13u8.serialize(writer)?;
                idx.serialize(writer)
            }
            (Encoding::Explicit, _, Some((opcode, idx))) if idx <= 0xff => {
                opcode.serialize(writer)?;
                (idx as u8).serialize(writer)
            }
            _ => self.serialize(writer),
        }
    }
}

/// Type code used by `newarray`
pub(super) fn array_type_code(base_type: BaseType) -> u8 {
    match base_type {
        BaseType::Boolean => 4,
        BaseType::Char => 5,
        BaseType::Float => 6,
        BaseType::Double => 7,
        BaseType::Byte => 8,
        BaseType::Short => 9,
        BaseType::Int => 10,
        BaseType::Long => 11,
    }
}

impl Serialize for Instruction {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        /* The load/store instructions follow the same pattern:
         *
         *   - short form (0-3) have special bytes
         *   - normal form (0-255) use `iload` plus a byte operand
         *   - wide form (255-65535) use `wide iload` plus two byte operands
         */
        fn serialize_load_or_store<W: WriteBytesExt>(
            idx: u16,
            short_form_start: u8,
            normal_form: u8,
            writer: &mut W,
        ) -> Result<()> {
            match u8::try_from(idx) {
                Ok(n @ 0..=3) => (short_form_start + n).serialize(writer),
                Ok(n) => {
                    normal_form.serialize(writer)?;
                    n.serialize(writer)
                }
                Err(_) => {
                    0xC4u8.serialize(writer)?;
                    normal_form.serialize(writer)?;
                    idx.serialize(writer)
                }
            }
        }

        /// Opcode followed by a constant pool index
        fn serialize_indexed<W: WriteBytesExt>(
            opcode: u8,
            idx: &ConstantIndex,
            writer: &mut W,
        ) -> Result<()> {
            opcode.serialize(writer)?;
            idx.serialize(writer)
        }

        match self {
            Instruction::Nop => 0x00u8.serialize(writer)?,
            Instruction::AConstNull => 0x01u8.serialize(writer)?,
            Instruction::IConstM1 => 0x02u8.serialize(writer)?,
            Instruction::IConst0 => 0x03u8.serialize(writer)?,
            Instruction::IConst1 => 0x04u8.serialize(writer)?,
            Instruction::IConst2 => 0x05u8.serialize(writer)?,
            Instruction::IConst3 => 0x06u8.serialize(writer)?,
            Instruction::IConst4 => 0x07u8.serialize(writer)?,
            Instruction::IConst5 => 0x08u8.serialize(writer)?,
            Instruction::LConst0 => 0x09u8.serialize(writer)?,
            Instruction::LConst1 => 0x0au8.serialize(writer)?,
            Instruction::FConst0 => 0x0bu8.serialize(writer)?,
            Instruction::FConst1 => 0x0cu8.serialize(writer)?,
            Instruction::FConst2 => 0x0du8.serialize(writer)?,
            Instruction::DConst0 => 0x0eu8.serialize(writer)?,
            Instruction::DConst1 => 0x0fu8.serialize(writer)?,
            Instruction::BiPush(b) => {
                0x10u8.serialize(writer)?;
                b.serialize(writer)?;
            }
            Instruction::SiPush(s) => {
                0x11u8.serialize(writer)?;
                s.serialize(writer)?;
            }
            Instruction::Ldc(ConstantIndex(idx)) => match u8::try_from(*idx) {
                Ok(b) => {
                    0x12u8.serialize(writer)?;
                    b.serialize(writer)?;
                }
                Err(_) => {
                    0x13u8.serialize(writer)?;
                    idx.serialize(writer)?;
                }
            },
            Instruction::Ldc2(idx) => serialize_indexed(0x14, idx, writer)?,
            Instruction::ILoad(idx) => serialize_load_or_store(*idx, 0x1A, 0x15, writer)?,
            Instruction::LLoad(idx) => serialize_load_or_store(*idx, 0x1E, 0x16, writer)?,
            Instruction::FLoad(idx) => serialize_load_or_store(*idx, 0x22, 0x17, writer)?,
            Instruction::DLoad(idx) => serialize_load_or_store(*idx, 0x26, 0x18, writer)?,
            Instruction::ALoad(idx) => serialize_load_or_store(*idx, 0x2A, 0x19, writer)?,
            Instruction::IALoad => 0x2eu8.serialize(writer)?,
            Instruction::LALoad => 0x2fu8.serialize(writer)?,
            Instruction::FALoad => 0x30u8.serialize(writer)?,
            Instruction::DALoad => 0x31u8.serialize(writer)?,
            Instruction::AALoad => 0x32u8.serialize(writer)?,
            Instruction::BALoad => 0x33u8.serialize(writer)?,
            Instruction::CALoad => 0x34u8.serialize(writer)?,
            Instruction::SALoad => 0x35u8.serialize(writer)?,
            Instruction::IStore(idx) => serialize_load_or_store(*idx, 0x3B, 0x36, writer)?,
            Instruction::LStore(idx) => serialize_load_or_store(*idx, 0x3F, 0x37, writer)?,
            Instruction::FStore(idx) => serialize_load_or_store(*idx, 0x43, 0x38, writer)?,
            Instruction::DStore(idx) => serialize_load_or_store(*idx, 0x47, 0x39, writer)?,
            Instruction::AStore(idx) => serialize_load_or_store(*idx, 0x4B, 0x3A, writer)?,
            Instruction::IAStore => 0x4fu8.serialize(writer)?,
            Instruction::LAStore => 0x50u8.serialize(writer)?,
            Instruction::FAStore => 0x51u8.serialize(writer)?,
            Instruction::DAStore => 0x52u8.serialize(writer)?,
            Instruction::AAStore => 0x53u8.serialize(writer)?,
            Instruction::BAStore => 0x54u8.serialize(writer)?,
            Instruction::CAStore => 0x55u8.serialize(writer)?,
            Instruction::SAStore => 0x56u8.serialize(writer)?,
            Instruction::Pop => 0x57u8.serialize(writer)?,
            Instruction::Pop2 => 0x58u8.serialize(writer)?,
            Instruction::Dup => 0x59u8.serialize(writer)?,
            Instruction::DupX1 => 0x5au8.serialize(writer)?,
            Instruction::DupX2 => 0x5bu8.serialize(writer)?,
            Instruction::Dup2 => 0x5cu8.serialize(writer)?,
            Instruction::Dup2X1 => 0x5du8.serialize(writer)?,
            Instruction::Dup2X2 => 0x5eu8.serialize(writer)?,
            Instruction::Swap => 0x5fu8.serialize(writer)?,
            Instruction::IAdd => 0x60u8.serialize(writer)?,
            Instruction::LAdd => 0x61u8.serialize(writer)?,
            Instruction::FAdd => 0x62u8.serialize(writer)?,
            Instruction::DAdd => 0x63u8.serialize(writer)?,
            Instruction::ISub => 0x64u8.serialize(writer)?,
            Instruction::LSub => 0x65u8.serialize(writer)?,
            Instruction::FSub => 0x66u8.serialize(writer)?,
            Instruction::DSub => 0x67u8.serialize(writer)?,
            Instruction::IMul => 0x68u8.serialize(writer)?,
            Instruction::LMul => 0x69u8.serialize(writer)?,
            Instruction::FMul => 0x6au8.serialize(writer)?,
            Instruction::DMul => 0x6bu8.serialize(writer)?,
            Instruction::IDiv => 0x6cu8.serialize(writer)?,
            Instruction::LDiv => 0x6du8.serialize(writer)?,
            Instruction::FDiv => 0x6eu8.serialize(writer)?,
            Instruction::DDiv => 0x6fu8.serialize(writer)?,
            Instruction::IRem => 0x70u8.serialize(writer)?,
            Instruction::LRem => 0x71u8.serialize(writer)?,
            Instruction::FRem => 0x72u8.serialize(writer)?,
            Instruction::DRem => 0x73u8.serialize(writer)?,
            Instruction::INeg => 0x74u8.serialize(writer)?,
            Instruction::LNeg => 0x75u8.serialize(writer)?,
            Instruction::FNeg => 0x76u8.serialize(writer)?,
            Instruction::DNeg => 0x77u8.serialize(writer)?,
            Instruction::ISh(ShiftType::Left) => 0x78u8.serialize(writer)?,
            Instruction::LSh(ShiftType::Left) => 0x79u8.serialize(writer)?,
            Instruction::ISh(ShiftType::ArithmeticRight) => 0x7au8.serialize(writer)?,
            Instruction::LSh(ShiftType::ArithmeticRight) => 0x7bu8.serialize(writer)?,
            Instruction::ISh(ShiftType::LogicalRight) => 0x7cu8.serialize(writer)?,
            Instruction::LSh(ShiftType::LogicalRight) => 0x7du8.serialize(writer)?,
            Instruction::IAnd => 0x7eu8.serialize(writer)?,
            Instruction::LAnd => 0x7fu8.serialize(writer)?,
            Instruction::IOr => 0x80u8.serialize(writer)?,
            Instruction::LOr => 0x81u8.serialize(writer)?,
            Instruction::IXor => 0x82u8.serialize(writer)?,
            Instruction::LXor => 0x83u8.serialize(writer)?,
            Instruction::IInc(idx, diff) => match (u8::try_from(*idx), i8::try_from(*diff)) {
                (Ok(b), Ok(d)) => {
                    0x84u8.serialize(writer)?;
                    b.serialize(writer)?;
                    d.serialize(writer)?;
                }
                _ => {
                    0xc4u8.serialize(writer)?;
                    0x84u8.serialize(writer)?;
                    idx.serialize(writer)?;
                    diff.serialize(writer)?;
                }
            },
            Instruction::I2L => 0x85u8.serialize(writer)?,
            Instruction::I2F => 0x86u8.serialize(writer)?,
            Instruction::I2D => 0x87u8.serialize(writer)?,
            Instruction::L2I => 0x88u8.serialize(writer)?,
            Instruction::L2F => 0x89u8.serialize(writer)?,
            Instruction::L2D => 0x8au8.serialize(writer)?,
            Instruction::F2I => 0x8bu8.serialize(writer)?,
            Instruction::F2L => 0x8cu8.serialize(writer)?,
            Instruction::F2D => 0x8du8.serialize(writer)?,
            Instruction::D2I => 0x8eu8.serialize(writer)?,
            Instruction::D2L => 0x8fu8.serialize(writer)?,
            Instruction::D2F => 0x90u8.serialize(writer)?,
            Instruction::I2B => 0x91u8.serialize(writer)?,
            Instruction::I2C => 0x92u8.serialize(writer)?,
            Instruction::I2S => 0x93u8.serialize(writer)?,
            Instruction::LCmp => 0x94u8.serialize(writer)?,
            Instruction::FCmp(CompareMode::L) => 0x95u8.serialize(writer)?,
            Instruction::FCmp(CompareMode::G) => 0x96u8.serialize(writer)?,
            Instruction::DCmp(CompareMode::L) => 0x97u8.serialize(writer)?,
            Instruction::DCmp(CompareMode::G) => 0x98u8.serialize(writer)?,
            Instruction::GetStatic(idx) => serialize_indexed(0xb2, idx, writer)?,
            Instruction::PutStatic(idx) => serialize_indexed(0xb3, idx, writer)?,
            Instruction::GetField(idx) => serialize_indexed(0xb4, idx, writer)?,
            Instruction::PutField(idx) => serialize_indexed(0xb5, idx, writer)?,
            Instruction::Invoke(InvokeType::Virtual, idx) => serialize_indexed(0xb6, idx, writer)?,
            Instruction::Invoke(InvokeType::Special, idx) => serialize_indexed(0xb7, idx, writer)?,
            Instruction::Invoke(InvokeType::Static, idx) => serialize_indexed(0xb8, idx, writer)?,
            Instruction::Invoke(InvokeType::Interface(cnt), idx) => {
                serialize_indexed(0xb9, idx, writer)?;
                cnt.serialize(writer)?;
                0u8.serialize(writer)?;
            }
            Instruction::InvokeDynamic(idx) => {
                serialize_indexed(0xba, idx, writer)?;
                0u16.serialize(writer)?;
            }
            Instruction::New(idx) => serialize_indexed(0xbb, idx, writer)?,
            Instruction::NewArray(base_type) => {
                0xbcu8.serialize(writer)?;
                array_type_code(*base_type).serialize(writer)?;
            }
            Instruction::ANewArray(idx) => serialize_indexed(0xbd, idx, writer)?,
            Instruction::ArrayLength => 0xbeu8.serialize(writer)?,
            Instruction::CheckCast(idx) => serialize_indexed(0xc0, idx, writer)?,
            Instruction::InstanceOf(idx) => serialize_indexed(0xc1, idx, writer)?,
            Instruction::MonitorEnter => 0xc2u8.serialize(writer)?,
            Instruction::MonitorExit => 0xc3u8.serialize(writer)?,
            Instruction::MultiANewArray(idx, dimensions) => {
                serialize_indexed(0xc5, idx, writer)?;
                dimensions.serialize(writer)?;
            }
        }
        Ok(())
    }
}

/// Instruction which can transfer control somewhere other than the next instruction
///
/// The label type `Lbl` is [`InsnHandle`] inside an instruction list, absolute byte offsets
/// while decoding, and relative displacements while encoding.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BranchInstruction<Lbl> {
    If(OrdComparison, Lbl), // covers `ifeq`, `ifne`, `iflt`, `ifge`, `ifgt`, `ifle`
    IfICmp(OrdComparison, Lbl), // covers `if_icmpeq`, `if_icmpne`, `if_icmplt`, ... `if_icmple`
    IfACmp(EqComparison, Lbl), // covers `if_acmpeq`, `if_acmpne`
    IfNull(EqComparison, Lbl), // covers `ifnull`, `ifnonnull`
    Goto(Lbl),
    GotoW(Lbl),
    TableSwitch {
        /// Jump target if the argument is less than `low` or greater than
        /// `low + targets.len() - 1`
        default: Lbl,

        /// Value associated with the first jump target
        low: i32,

        /// Jump targets
        targets: Vec<Lbl>,
    },
    LookupSwitch {
        /// Jump target if there is no corresponding key
        default: Lbl,

        /// Jump targets (sorted so that the keys are ascending)
        targets: Vec<(i32, Lbl)>,
    },
    IReturn,
    LReturn,
    FReturn,
    DReturn,
    AReturn,
    Return,
    AThrow,
}

/// Padding after a switch opcode at `offset` so that the operands are 4-byte aligned
pub const fn switch_padding(offset: usize) -> usize {
    (4 - (offset + 1) % 4) % 4
}

impl<Lbl> BranchInstruction<Lbl> {
    /// Can execution continue to the next instruction?
    pub fn falls_through(&self) -> bool {
        self.is_conditional()
    }

    /// Is this a two-way conditional jump?
    pub fn is_conditional(&self) -> bool {
        matches!(
            self,
            BranchInstruction::If(_, _)
                | BranchInstruction::IfICmp(_, _)
                | BranchInstruction::IfACmp(_, _)
                | BranchInstruction::IfNull(_, _)
        )
    }

    /// Jump targets (the default target comes first for switches)
    pub fn jump_targets(&self) -> Vec<&Lbl> {
        match self {
            BranchInstruction::If(_, lbl)
            | BranchInstruction::IfICmp(_, lbl)
            | BranchInstruction::IfACmp(_, lbl)
            | BranchInstruction::IfNull(_, lbl)
            | BranchInstruction::Goto(lbl)
            | BranchInstruction::GotoW(lbl) => vec![lbl],
            BranchInstruction::TableSwitch {
                default, targets, ..
            } => std::iter::once(default).chain(targets.iter()).collect(),
            BranchInstruction::LookupSwitch { default, targets } => std::iter::once(default)
                .chain(targets.iter().map(|(_, lbl)| lbl))
                .collect(),
            BranchInstruction::IReturn
            | BranchInstruction::LReturn
            | BranchInstruction::FReturn
            | BranchInstruction::DReturn
            | BranchInstruction::AReturn
            | BranchInstruction::Return
            | BranchInstruction::AThrow => vec![],
        }
    }

    /// Rewrite every jump target, stopping at the first failure
    pub fn try_map_labels<Lbl2, E>(
        &self,
        mut map_label: impl FnMut(&Lbl) -> std::result::Result<Lbl2, E>,
    ) -> std::result::Result<BranchInstruction<Lbl2>, E> {
        use BranchInstruction::*;

        Ok(match self {
            If(op, lbl) => If(*op, map_label(lbl)?),
            IfICmp(op, lbl) => IfICmp(*op, map_label(lbl)?),
            IfACmp(op, lbl) => IfACmp(*op, map_label(lbl)?),
            IfNull(op, lbl) => IfNull(*op, map_label(lbl)?),
            Goto(lbl) => Goto(map_label(lbl)?),
            GotoW(lbl) => GotoW(map_label(lbl)?),
            TableSwitch {
                default,
                low,
                targets,
            } => TableSwitch {
                default: map_label(default)?,
                low: *low,
                targets: targets
                    .iter()
                    .map(&mut map_label)
                    .collect::<std::result::Result<_, _>>()?,
            },
            LookupSwitch { default, targets } => LookupSwitch {
                default: map_label(default)?,
                targets: targets
                    .iter()
                    .map(|(key, lbl)| map_label(lbl).map(|lbl| (*key, lbl)))
                    .collect::<std::result::Result<_, _>>()?,
            },
            IReturn => IReturn,
            LReturn => LReturn,
            FReturn => FReturn,
            DReturn => DReturn,
            AReturn => AReturn,
            Return => Return,
            AThrow => AThrow,
        })
    }

    pub fn map_labels<Lbl2>(
        &self,
        mut map_label: impl FnMut(&Lbl) -> Lbl2,
    ) -> BranchInstruction<Lbl2> {
        match self.try_map_labels(|lbl| Ok::<Lbl2, Infallible>(map_label(lbl))) {
            Ok(mapped) => mapped,
            Err(never) => match never {},
        }
    }

    /// Encoded size at a given offset
    ///
    /// Switches depend on the offset (for padding). Short jumps depend on whether they have been
    /// widened: a wide `goto` is a `goto_w`, and a wide conditional is the inverted conditional
    /// jumping over a `goto_w`.
    pub fn width_at(&self, offset: usize, wide: bool) -> usize {
        match self {
            BranchInstruction::IReturn
            | BranchInstruction::LReturn
            | BranchInstruction::FReturn
            | BranchInstruction::DReturn
            | BranchInstruction::AReturn
            | BranchInstruction::Return
            | BranchInstruction::AThrow => 1,

            BranchInstruction::If(_, _)
            | BranchInstruction::IfICmp(_, _)
            | BranchInstruction::IfACmp(_, _)
            | BranchInstruction::IfNull(_, _) => {
                if wide {
                    8
                } else {
                    3
                }
            }

            BranchInstruction::Goto(_) => {
                if wide {
                    5
                } else {
                    3
                }
            }

            BranchInstruction::GotoW(_) => 5,

            BranchInstruction::TableSwitch { targets, .. } => {
                1 + switch_padding(offset) + 4 * (3 + targets.len())
            }

            BranchInstruction::LookupSwitch { targets, .. } => {
                1 + switch_padding(offset) + 8 * (1 + targets.len())
            }
        }
    }

    /// Upper bound on how many bytes this instruction could grow by during layout
    pub fn max_growth(&self) -> usize {
        match self {
            BranchInstruction::Goto(_) => 2,
            BranchInstruction::TableSwitch { .. } | BranchInstruction::LookupSwitch { .. } => 3,
            _ if self.is_conditional() => 5,
            _ => 0,
        }
    }

    /// Does this jump have a 16-bit displacement (which might need widening)?
    pub fn has_short_displacement(&self) -> bool {
        matches!(self, BranchInstruction::Goto(_)) || self.is_conditional()
    }
}

impl<Lbl: PartialEq> BranchInstruction<Lbl> {
    /// Does any jump target match?
    pub fn targets(&self, target: &Lbl) -> bool {
        self.jump_targets().into_iter().any(|lbl| lbl == target)
    }
}

impl<Lbl: PartialEq + Copy> BranchInstruction<Lbl> {
    /// Replace every occurrence of a jump target, returning whether anything changed
    pub fn replace_target(&mut self, old: Lbl, new: Lbl) -> bool {
        let mut changed = false;
        let mut update = |lbl: &mut Lbl| {
            if *lbl == old {
                *lbl = new;
                changed = true;
            }
        };
        match self {
            BranchInstruction::If(_, lbl)
            | BranchInstruction::IfICmp(_, lbl)
            | BranchInstruction::IfACmp(_, lbl)
            | BranchInstruction::IfNull(_, lbl)
            | BranchInstruction::Goto(lbl)
            | BranchInstruction::GotoW(lbl) => update(lbl),
            BranchInstruction::TableSwitch {
                default, targets, ..
            } => {
                update(default);
                targets.iter_mut().for_each(update);
            }
            BranchInstruction::LookupSwitch { default, targets } => {
                update(default);
                targets.iter_mut().for_each(|(_, lbl)| update(lbl));
            }
            BranchInstruction::IReturn
            | BranchInstruction::LReturn
            | BranchInstruction::FReturn
            | BranchInstruction::DReturn
            | BranchInstruction::AReturn
            | BranchInstruction::Return
            | BranchInstruction::AThrow => (),
        }
        changed
    }
}

/// Opcode of a conditional jump
fn conditional_opcode<Lbl>(insn: &BranchInstruction<Lbl>, negate: bool) -> Option<u8> {
    Some(match insn {
        BranchInstruction::If(comp, _) => match if negate { !*comp } else { *comp } {
            OrdComparison::EQ => 0x99,
            OrdComparison::NE => 0x9a,
            OrdComparison::LT => 0x9b,
            OrdComparison::GE => 0x9c,
            OrdComparison::GT => 0x9d,
            OrdComparison::LE => 0x9e,
        },
        BranchInstruction::IfICmp(comp, _) => match if negate { !*comp } else { *comp } {
            OrdComparison::EQ => 0x9f,
            OrdComparison::NE => 0xa0,
            OrdComparison::LT => 0xa1,
            OrdComparison::GE => 0xa2,
            OrdComparison::GT => 0xa3,
            OrdComparison::LE => 0xa4,
        },
        BranchInstruction::IfACmp(comp, _) => match if negate { !*comp } else { *comp } {
            EqComparison::EQ => 0xa5,
            EqComparison::NE => 0xa6,
        },
        BranchInstruction::IfNull(comp, _) => match if negate { !*comp } else { *comp } {
            EqComparison::EQ => 0xc6,
            EqComparison::NE => 0xc7,
        },
        _ => return None,
    })
}

impl BranchInstruction<i32> {
    /// Serialize a branch whose labels are displacements relative to the start of the instruction
    ///
    /// `offset` is the position of the instruction in the code array (needed for switch padding)
    /// and `wide` selects the long form of `goto` and conditional jumps.
    pub fn serialize_at<W: WriteBytesExt>(
        &self,
        offset: usize,
        wide: bool,
        writer: &mut W,
    ) -> Result<()> {
        fn short_displacement(displacement: i32) -> Result<i16> {
            i16::try_from(displacement).map_err(|_| {
                let msg = format!("Jump displacement {} needs a wide encoding", displacement);
                Error::new(ErrorKind::InvalidData, msg)
            })
        }

        match self {
            BranchInstruction::If(_, lbl)
            | BranchInstruction::IfICmp(_, lbl)
            | BranchInstruction::IfACmp(_, lbl)
            | BranchInstruction::IfNull(_, lbl) => {
                if wide {
                    // Inverted condition skips over the `goto_w` (3 + 5 bytes)
                    conditional_opcode(self, true).unwrap_or_default().serialize(writer)?;
                    8i16.serialize(writer)?;
                    0xc8u8.serialize(writer)?;
                    (lbl - 3).serialize(writer)?;
                } else {
                    conditional_opcode(self, false).unwrap_or_default().serialize(writer)?;
                    short_displacement(*lbl)?.serialize(writer)?;
                }
            }
            BranchInstruction::Goto(lbl) => {
                if wide {
                    0xc8u8.serialize(writer)?;
                    lbl.serialize(writer)?;
                } else {
                    0xa7u8.serialize(writer)?;
                    short_displacement(*lbl)?.serialize(writer)?;
                }
            }
            BranchInstruction::GotoW(lbl) => {
                0xc8u8.serialize(writer)?;
                lbl.serialize(writer)?;
            }
            BranchInstruction::TableSwitch {
                default,
                low,
                targets,
            } => {
                0xaau8.serialize(writer)?;
                for _ in 0..switch_padding(offset) {
                    0x00u8.serialize(writer)?;
                }
                default.serialize(writer)?;
                low.serialize(writer)?;
                (low + targets.len() as i32 - 1).serialize(writer)?;
                for target in targets {
                    target.serialize(writer)?;
                }
            }
            BranchInstruction::LookupSwitch { default, targets } => {
                0xabu8.serialize(writer)?;
                for _ in 0..switch_padding(offset) {
                    0x00u8.serialize(writer)?;
                }
                default.serialize(writer)?;
                (targets.len() as i32).serialize(writer)?;
                for (key, target) in targets {
                    key.serialize(writer)?;
                    target.serialize(writer)?;
                }
            }
            BranchInstruction::IReturn => 0xacu8.serialize(writer)?,
            BranchInstruction::LReturn => 0xadu8.serialize(writer)?,
            BranchInstruction::FReturn => 0xaeu8.serialize(writer)?,
            BranchInstruction::DReturn => 0xafu8.serialize(writer)?,
            BranchInstruction::AReturn => 0xb0u8.serialize(writer)?,
            BranchInstruction::Return => 0xb1u8.serialize(writer)?,
            BranchInstruction::AThrow => 0xbfu8.serialize(writer)?,
        }
        Ok(())
    }
}

/// Instruction stored in an [`crate::jvm::code::InstructionList`]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ListInstruction {
    Straight(Instruction),
    Branch(BranchInstruction<InsnHandle>),
}

impl ListInstruction {
    pub fn is_branch(&self) -> bool {
        matches!(self, ListInstruction::Branch(_))
    }

    pub fn as_straight(&self) -> Option<&Instruction> {
        match self {
            ListInstruction::Straight(insn) => Some(insn),
            ListInstruction::Branch(_) => None,
        }
    }
}

impl From<Instruction> for ListInstruction {
    fn from(insn: Instruction) -> ListInstruction {
        ListInstruction::Straight(insn)
    }
}

impl From<BranchInstruction<InsnHandle>> for ListInstruction {
    fn from(insn: BranchInstruction<InsnHandle>) -> ListInstruction {
        ListInstruction::Branch(insn)
    }
}

/// Possible bit shifts
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum ShiftType {
    Left,
    LogicalRight,
    ArithmeticRight,
}

/// Comparison modes for floating point
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum CompareMode {
    /// -1 on NaN
    L,

    /// 1 on NaN
    G,
}

/// Binary comparison operators available for `int` branches
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum OrdComparison {
    EQ,
    GE,
    GT,
    LE,
    LT,
    NE,
}

impl Not for OrdComparison {
    type Output = Self;

    fn not(self) -> Self::Output {
        match self {
            OrdComparison::EQ => OrdComparison::NE,
            OrdComparison::GE => OrdComparison::LT,
            OrdComparison::GT => OrdComparison::LE,
            OrdComparison::LE => OrdComparison::GT,
            OrdComparison::LT => OrdComparison::GE,
            OrdComparison::NE => OrdComparison::EQ,
        }
    }
}

/// Equality/inequality comparison operators
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum EqComparison {
    EQ,
    NE,
}

impl Not for EqComparison {
    type Output = Self;

    fn not(self) -> Self::Output {
        match self {
            EqComparison::EQ => EqComparison::NE,
            EqComparison::NE => EqComparison::EQ,
        }
    }
}

/// Type of method to invoke
///
/// Note: `InvokeDynamic` is kept separate because the constant argument it expects is not to a
/// `Constant::MethodRef`.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum InvokeType {
    Virtual,
    Special,
    Static,
    Interface(u8), // `count` is of total arguments, where `long`/`double` count for 2
}
