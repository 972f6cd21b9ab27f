//! Decoding of code arrays back into instruction lists
//!
//! Every decoded instruction remembers its [`Encoding`] (`iload 1` rather than `iload_1`, `ldc_w`
//! for a small index, a needless `wide`), so re-encoding a decoded list reproduces the input as
//! long as no jump needs widening.

use super::instructions::switch_padding;
use super::{
    BranchInstruction, CompareMode, Encoding, EqComparison, InsnHandle, Instruction,
    InstructionList, InvokeType, ListInstruction, OrdComparison, ShiftType,
};
use crate::jvm::class_file::ConstantIndex;
use crate::jvm::{BaseType, Error};
use crate::util::Width;
use byteorder::{BigEndian, ReadBytesExt};
use std::collections::HashMap;
use std::io::Cursor;

/// Instruction as found in the code array, with jumps to absolute offsets
#[derive(Debug, Clone, PartialEq, Eq)]
enum Decoded {
    Straight(Instruction, Encoding),
    Branch(BranchInstruction<isize>),
}

struct Decoder<'a> {
    cursor: Cursor<&'a [u8]>,

    /// Offset of the instruction being decoded
    start: usize,
}

impl<'a> Decoder<'a> {
    fn position(&self) -> usize {
        self.cursor.position() as usize
    }

    fn truncated(&self) -> Error {
        Error::TruncatedCode(self.start)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        self.cursor.read_u8().map_err(|_| self.truncated())
    }

    fn i8(&mut self) -> Result<i8, Error> {
        self.cursor.read_i8().map_err(|_| self.truncated())
    }

    fn u16(&mut self) -> Result<u16, Error> {
        self.cursor
            .read_u16::<BigEndian>()
            .map_err(|_| self.truncated())
    }

    fn i16(&mut self) -> Result<i16, Error> {
        self.cursor
            .read_i16::<BigEndian>()
            .map_err(|_| self.truncated())
    }

    fn i32(&mut self) -> Result<i32, Error> {
        self.cursor
            .read_i32::<BigEndian>()
            .map_err(|_| self.truncated())
    }

    fn index(&mut self) -> Result<ConstantIndex, Error> {
        Ok(ConstantIndex(self.u16()?))
    }

    /// Absolute target of a jump with a 16-bit displacement
    fn short_target(&mut self) -> Result<isize, Error> {
        Ok(self.start as isize + self.i16()? as isize)
    }

    /// Absolute target of a jump with a 32-bit displacement
    fn wide_target(&mut self) -> Result<isize, Error> {
        Ok(self.start as isize + self.i32()? as isize)
    }

    fn malformed(&self, message: impl Into<String>) -> Error {
        Error::MalformedInstruction {
            offset: self.start,
            message: message.into(),
        }
    }

    /// Decode the instruction at the current position
    fn decode(&mut self) -> Result<Decoded, Error> {
        use Instruction::*;

        self.start = self.position();
        let opcode = self.u8()?;

        if let Some(insn) = operandless_instruction(opcode) {
            return Ok(Decoded::Straight(insn, Encoding::Shortest));
        }

        let insn = match opcode {
            0x10 => BiPush(self.i8()?),
            0x11 => SiPush(self.i16()?),
            0x12 => Ldc(ConstantIndex(self.u8()? as u16)),
            0x13 => Ldc(self.index()?),
            0x14 => Ldc2(self.index()?),
            0x15..=0x19 => load_or_store(opcode, self.u8()? as u16),
            0x1a..=0x2d => {
                let n = (opcode - 0x1a) % 4;
                load_or_store(0x15 + (opcode - 0x1a) / 4, n as u16)
            }
            0x36..=0x3a => load_or_store(opcode, self.u8()? as u16),
            0x3b..=0x4e => {
                let n = (opcode - 0x3b) % 4;
                load_or_store(0x36 + (opcode - 0x3b) / 4, n as u16)
            }
            0x84 => IInc(self.u8()? as u16, self.i8()? as i16),
            0xb2 => GetStatic(self.index()?),
            0xb3 => PutStatic(self.index()?),
            0xb4 => GetField(self.index()?),
            0xb5 => PutField(self.index()?),
            0xb6 => Invoke(InvokeType::Virtual, self.index()?),
            0xb7 => Invoke(InvokeType::Special, self.index()?),
            0xb8 => Invoke(InvokeType::Static, self.index()?),
            0xb9 => {
                let index = self.index()?;
                let count = self.u8()?;
                if self.u8()? != 0 {
                    return Err(self.malformed("`invokeinterface` must end with a zero byte"));
                }
                Invoke(InvokeType::Interface(count), index)
            }
            0xba => {
                let index = self.index()?;
                if self.u16()? != 0 {
                    return Err(self.malformed("`invokedynamic` must end with two zero bytes"));
                }
                InvokeDynamic(index)
            }
            0xbb => New(self.index()?),
            0xbc => {
                let code = self.u8()?;
                match base_type_from_code(code) {
                    Some(base_type) => NewArray(base_type),
                    None => return Err(self.malformed(format!("bad array type {}", code))),
                }
            }
            0xbd => ANewArray(self.index()?),
            0xc0 => CheckCast(self.index()?),
            0xc1 => InstanceOf(self.index()?),
            0xc4 => {
                let modified = self.u8()?;
                match modified {
                    0x15..=0x19 | 0x36..=0x3a => load_or_store(modified, self.u16()?),
                    0x84 => IInc(self.u16()?, self.i16()?),
                    0xa9 => {
                        return Err(Error::UnsupportedOpcode {
                            opcode: modified,
                            offset: self.start,
                        })
                    }
                    _ => {
                        return Err(self.malformed(format!(
                            "`wide` cannot modify opcode {:#04x}",
                            modified
                        )))
                    }
                }
            }
            0xc5 => MultiANewArray(self.index()?, self.u8()?),
            _ => return self.decode_branch(opcode).map(Decoded::Branch),
        };

        let encoding = if self.position() - self.start == insn.width() {
            Encoding::Shortest
        } else if opcode == 0xc4 {
            Encoding::Wide
        } else {
            Encoding::Explicit
        };
        Ok(Decoded::Straight(insn, encoding))
    }

    fn decode_branch(&mut self, opcode: u8) -> Result<BranchInstruction<isize>, Error> {
        use BranchInstruction::*;

        const ORD_COMPARISONS: [OrdComparison; 6] = [
            OrdComparison::EQ,
            OrdComparison::NE,
            OrdComparison::LT,
            OrdComparison::GE,
            OrdComparison::GT,
            OrdComparison::LE,
        ];

        Ok(match opcode {
            0x99..=0x9e => If(
                ORD_COMPARISONS[(opcode - 0x99) as usize],
                self.short_target()?,
            ),
            0x9f..=0xa4 => IfICmp(
                ORD_COMPARISONS[(opcode - 0x9f) as usize],
                self.short_target()?,
            ),
            0xa5 => IfACmp(EqComparison::EQ, self.short_target()?),
            0xa6 => IfACmp(EqComparison::NE, self.short_target()?),
            0xa7 => Goto(self.short_target()?),
            0xaa => {
                self.skip_padding()?;
                let default = self.wide_target()?;
                let low = self.i32()?;
                let high = self.i32()?;
                if high < low {
                    return Err(self.malformed(format!(
                        "`tableswitch` range {}..={} is empty",
                        low, high
                    )));
                }
                let count = (high as i64 - low as i64 + 1) as usize;
                let targets = (0..count)
                    .map(|_| self.wide_target())
                    .collect::<Result<_, _>>()?;
                TableSwitch {
                    default,
                    low,
                    targets,
                }
            }
            0xab => {
                self.skip_padding()?;
                let default = self.wide_target()?;
                let count = self.i32()?;
                if count < 0 {
                    return Err(self.malformed(format!("negative `lookupswitch` size {}", count)));
                }
                let targets = (0..count)
                    .map(|_| -> Result<(i32, isize), Error> {
                        Ok((self.i32()?, self.wide_target()?))
                    })
                    .collect::<Result<_, _>>()?;
                LookupSwitch { default, targets }
            }
            0xac => IReturn,
            0xad => LReturn,
            0xae => FReturn,
            0xaf => DReturn,
            0xb0 => AReturn,
            0xb1 => Return,
            0xbf => AThrow,
            0xc6 => IfNull(EqComparison::EQ, self.short_target()?),
            0xc7 => IfNull(EqComparison::NE, self.short_target()?),
            0xc8 => GotoW(self.wide_target()?),
            0xa8 | 0xa9 | 0xc9 => {
                return Err(Error::UnsupportedOpcode {
                    opcode,
                    offset: self.start,
                })
            }
            _ => {
                return Err(Error::UnknownOpcode {
                    opcode,
                    offset: self.start,
                })
            }
        })
    }

    fn skip_padding(&mut self) -> Result<(), Error> {
        for _ in 0..switch_padding(self.start) {
            self.u8()?;
        }
        Ok(())
    }
}

/// Load or store given the opcode of its one byte index form
fn load_or_store(opcode: u8, index: u16) -> Instruction {
    match opcode {
        0x15 => Instruction::ILoad(index),
        0x16 => Instruction::LLoad(index),
        0x17 => Instruction::FLoad(index),
        0x18 => Instruction::DLoad(index),
        0x19 => Instruction::ALoad(index),
        0x36 => Instruction::IStore(index),
        0x37 => Instruction::LStore(index),
        0x38 => Instruction::FStore(index),
        0x39 => Instruction::DStore(index),
        _ => Instruction::AStore(index),
    }
}

fn base_type_from_code(code: u8) -> Option<BaseType> {
    Some(match code {
        4 => BaseType::Boolean,
        5 => BaseType::Char,
        6 => BaseType::Float,
        7 => BaseType::Double,
        8 => BaseType::Byte,
        9 => BaseType::Short,
        10 => BaseType::Int,
        11 => BaseType::Long,
        _ => return None,
    })
}

/// Single byte instructions
fn operandless_instruction(opcode: u8) -> Option<Instruction> {
    use Instruction::*;

    Some(match opcode {
        0x00 => Nop,
        0x01 => AConstNull,
        0x02 => IConstM1,
        0x03 => IConst0,
        0x04 => IConst1,
        0x05 => IConst2,
        0x06 => IConst3,
        0x07 => IConst4,
        0x08 => IConst5,
        0x09 => LConst0,
        0x0a => LConst1,
        0x0b => FConst0,
        0x0c => FConst1,
        0x0d => FConst2,
        0x0e => DConst0,
        0x0f => DConst1,
        0x2e => IALoad,
        0x2f => LALoad,
        0x30 => FALoad,
        0x31 => DALoad,
        0x32 => AALoad,
        0x33 => BALoad,
        0x34 => CALoad,
        0x35 => SALoad,
        0x4f => IAStore,
        0x50 => LAStore,
        0x51 => FAStore,
        0x52 => DAStore,
        0x53 => AAStore,
        0x54 => BAStore,
        0x55 => CAStore,
        0x56 => SAStore,
        0x57 => Pop,
        0x58 => Pop2,
        0x59 => Dup,
        0x5a => DupX1,
        0x5b => DupX2,
        0x5c => Dup2,
        0x5d => Dup2X1,
        0x5e => Dup2X2,
        0x5f => Swap,
        0x60 => IAdd,
        0x61 => LAdd,
        0x62 => FAdd,
        0x63 => DAdd,
        0x64 => ISub,
        0x65 => LSub,
        0x66 => FSub,
        0x67 => DSub,
        0x68 => IMul,
        0x69 => LMul,
        0x6a => FMul,
        0x6b => DMul,
        0x6c => IDiv,
        0x6d => LDiv,
        0x6e => FDiv,
        0x6f => DDiv,
        0x70 => IRem,
        0x71 => LRem,
        0x72 => FRem,
        0x73 => DRem,
        0x74 => INeg,
        0x75 => LNeg,
        0x76 => FNeg,
        0x77 => DNeg,
        0x78 => ISh(ShiftType::Left),
        0x79 => LSh(ShiftType::Left),
        0x7a => ISh(ShiftType::ArithmeticRight),
        0x7b => LSh(ShiftType::ArithmeticRight),
        0x7c => ISh(ShiftType::LogicalRight),
        0x7d => LSh(ShiftType::LogicalRight),
        0x7e => IAnd,
        0x7f => LAnd,
        0x80 => IOr,
        0x81 => LOr,
        0x82 => IXor,
        0x83 => LXor,
        0x85 => I2L,
        0x86 => I2F,
        0x87 => I2D,
        0x88 => L2I,
        0x89 => L2F,
        0x8a => L2D,
        0x8b => F2I,
        0x8c => F2L,
        0x8d => F2D,
        0x8e => D2I,
        0x8f => D2L,
        0x90 => D2F,
        0x91 => I2B,
        0x92 => I2C,
        0x93 => I2S,
        0x94 => LCmp,
        0x95 => FCmp(CompareMode::L),
        0x96 => FCmp(CompareMode::G),
        0x97 => DCmp(CompareMode::L),
        0x98 => DCmp(CompareMode::G),
        0xbe => ArrayLength,
        0xc2 => MonitorEnter,
        0xc3 => MonitorExit,
        _ => return None,
    })
}

/// Decode every instruction of a code array, along with its offset
fn decode_all(code: &[u8]) -> Result<Vec<(usize, Decoded)>, Error> {
    let mut decoder = Decoder {
        cursor: Cursor::new(code),
        start: 0,
    };
    let mut decoded = vec![];
    while decoder.position() < code.len() {
        let insn = decoder.decode()?;
        decoded.push((decoder.start, insn));
    }
    Ok(decoded)
}

impl InstructionList {
    /// Decode a code array into a fresh (resolved) list
    pub fn from_bytes(code: &[u8]) -> Result<InstructionList, Error> {
        let decoded = decode_all(code)?;
        let mut list = InstructionList::new();

        // Allocate a handle for every instruction (branches get a placeholder for now)
        let mut handles: HashMap<isize, InsnHandle> = HashMap::new();
        let mut ordered = Vec::with_capacity(decoded.len());
        for (offset, insn) in &decoded {
            let (placeholder, encoding) = match insn {
                Decoded::Straight(insn, encoding) => {
                    (ListInstruction::Straight(insn.clone()), *encoding)
                }
                Decoded::Branch(_) => (
                    ListInstruction::Branch(BranchInstruction::Return),
                    Encoding::Shortest,
                ),
            };
            let handle = list.allocate(placeholder);
            list.node_mut(handle)?.encoding = encoding;
            let last = list.last;
            list.link_after(handle, last)?;
            handles.insert(*offset as isize, handle);
            ordered.push(handle);
        }

        // Resolve jump targets to handles
        for ((offset, insn), handle) in decoded.iter().zip(&ordered) {
            if let Decoded::Branch(branch) = insn {
                let resolved = branch.try_map_labels(|target| {
                    handles
                        .get(target)
                        .copied()
                        .ok_or(Error::InvalidBranchTarget {
                            offset: *offset,
                            target: *target,
                        })
                })?;
                list.node_mut(*handle)?.insn = ListInstruction::Branch(resolved);
                list.register_branch(*handle)?;
            }
        }

        list.set_positions(true)?;
        log::debug!(
            "Decoded {} instructions from {} bytes",
            list.len(),
            code.len()
        );
        Ok(list)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::Targeter;

    #[test]
    fn short_and_wide_forms() {
        let list = InstructionList::from_bytes(&[
            0x1b, // iload_1
            0x15, 0x07, // iload 7
            0xc4, 0x36, 0x01, 0x00, // wide istore 256
            0xc4, 0x84, 0x00, 0x02, 0xff, 0xfe, // wide iinc 2 -2
            0x12, 0x05, // ldc #5
            0xb1, // return
        ])
        .unwrap();
        let insns: Vec<ListInstruction> =
            list.instructions().map(|(_, insn)| insn.clone()).collect();
        assert_eq!(
            insns,
            vec![
                Instruction::ILoad(1).into(),
                Instruction::ILoad(7).into(),
                Instruction::IStore(256).into(),
                Instruction::IInc(2, -2).into(),
                Instruction::Ldc(ConstantIndex(5)).into(),
                BranchInstruction::Return.into(),
            ]
        );
    }

    #[test]
    fn longer_encodings_are_kept() {
        let code = [
            0x15, 0x00, // iload 0
            0x13, 0x00, 0x01, // ldc_w #1
            0xc4, 0x84, 0x00, 0x01, 0x00, 0x01, // wide iinc 1 1
            0xc4, 0x3a, 0x00, 0x02, // wide astore 2
            0x1a, // iload_0
            0xac, // ireturn
        ];
        let mut list = InstructionList::from_bytes(&code).unwrap();
        let encodings: Vec<Encoding> = list
            .iter()
            .map(|handle| list.encoding(handle).unwrap())
            .collect();
        assert_eq!(
            encodings,
            vec![
                Encoding::Explicit,
                Encoding::Explicit,
                Encoding::Wide,
                Encoding::Wide,
                Encoding::Shortest,
                Encoding::Shortest,
            ]
        );
        assert_eq!(list.to_bytes().unwrap(), code.to_vec());

        // A replaced instruction goes back to its shortest encoding
        let first = list.first().unwrap();
        list.set_instruction(first, Instruction::ILoad(1)).unwrap();
        assert_eq!(list.encoding(first).unwrap(), Encoding::Shortest);
        assert_eq!(&list.to_bytes().unwrap()[..2], &[0x1b, 0x13]);

        list.set_encoding(first, Encoding::Wide).unwrap();
        assert_eq!(&list.to_bytes().unwrap()[..5], &[0xc4, 0x15, 0x00, 0x01, 0x13]);
    }

    #[test]
    fn jumps_become_handles() {
        let list = InstructionList::from_bytes(&[
            0x03, // 0: iconst_0
            0x99, 0x00, 0x04, // 1: ifeq +4
            0xb1, // 4: return
            0xa7, 0xff, 0xfb, // 5: goto -5
        ])
        .unwrap();
        let return_handle = list.find_by_offset(4).unwrap();
        let goto_handle = list.find_by_offset(5).unwrap();
        assert_eq!(
            list.get(goto_handle).unwrap(),
            &ListInstruction::Branch(BranchInstruction::Goto(list.first().unwrap()))
        );
        assert!(list
            .targeters(goto_handle)
            .unwrap()
            .contains(&Targeter::Branch(list.find_by_offset(1).unwrap())));
        assert!(list.targeters(return_handle).unwrap().is_empty());
    }

    #[test]
    fn bad_code_arrays() {
        assert!(matches!(
            InstructionList::from_bytes(&[0x11, 0x00]),
            Err(Error::TruncatedCode(0))
        ));
        assert!(matches!(
            InstructionList::from_bytes(&[0x00, 0xa8, 0x00, 0x00]),
            Err(Error::UnsupportedOpcode {
                opcode: 0xa8,
                offset: 1
            })
        ));
        assert!(matches!(
            InstructionList::from_bytes(&[0xcb]),
            Err(Error::UnknownOpcode { opcode: 0xcb, .. })
        ));
        assert!(matches!(
            InstructionList::from_bytes(&[0xa7, 0x00, 0x02, 0xb1]),
            Err(Error::InvalidBranchTarget {
                offset: 0,
                target: 2
            })
        ));
    }
}
