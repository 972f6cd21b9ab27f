use super::{
    ControlFlowGraph, ExceptionHandler, HandleMap, InsnHandle, InstructionList,
    InstructionTargeter, LineNumber, LocalVariable,
};
use crate::jvm::class_file::{
    Attribute, BytecodeArray, Code, ConstantIndex, ConstantPool, ExceptionTableEntry,
    LineNumberTable, LocalVariableTable, StackMapTable,
};
use crate::jvm::class_graph::ClassHierarchy;
use crate::jvm::verifier::{infer_frames, stack_map_table};
use crate::jvm::{Error, MethodContext, RenderDescriptor};

/// Method body along with the records that point into it
///
/// The records are created through the methods here so that they register themselves on the
/// instructions they reference.
#[derive(Debug)]
pub struct MethodCode {
    pub instructions: InstructionList,
    pub exception_handlers: Vec<ExceptionHandler>,
    pub local_variables: Vec<LocalVariable>,
    pub line_numbers: Vec<LineNumber>,
}

/// Everything a `Code` attribute needs, produced by [`MethodCode::generate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedCode {
    pub code: Vec<u8>,
    pub max_stack: u16,
    pub max_locals: u16,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub line_numbers: LineNumberTable,
    pub local_variables: LocalVariableTable,
    pub stack_map: StackMapTable,
}

impl MethodCode {
    pub fn new(instructions: InstructionList) -> MethodCode {
        MethodCode {
            instructions,
            exception_handlers: vec![],
            local_variables: vec![],
            line_numbers: vec![],
        }
    }

    /// Decode a code array along with its exception table
    pub fn from_bytes(
        code: &[u8],
        exception_table: &[ExceptionTableEntry],
    ) -> Result<MethodCode, Error> {
        let instructions = InstructionList::from_bytes(code)?;
        let mut method_code = MethodCode::new(instructions);

        for entry in exception_table {
            let invalid = Error::InvalidExceptionRange {
                start_pc: entry.start_pc,
                end_pc: entry.end_pc,
                handler_pc: entry.handler_pc,
            };
            let list = &method_code.instructions;
            let start = list.find_by_offset(entry.start_pc as usize);
            let handler = list.find_by_offset(entry.handler_pc as usize);

            // The range end is exclusive, so the last protected instruction is the one before
            let end = if entry.end_pc as usize == code.len() {
                list.last()
            } else {
                match list.find_by_offset(entry.end_pc as usize) {
                    Some(after_end) => list.prev(after_end)?,
                    None => None,
                }
            };

            let (start, end, handler) = match (start, end, handler) {
                (Some(start), Some(end), Some(handler)) if entry.start_pc < entry.end_pc => {
                    (start, end, handler)
                }
                _ => return Err(invalid),
            };
            let catch_type = match entry.catch_type {
                0 => None,
                index => Some(ConstantIndex(index)),
            };
            method_code.add_exception_handler(start, end, handler, catch_type)?;
        }

        Ok(method_code)
    }

    /// Protect the instructions from `start` to `end` (inclusive) with a handler
    pub fn add_exception_handler(
        &mut self,
        start: InsnHandle,
        end: InsnHandle,
        handler: InsnHandle,
        catch_type: Option<ConstantIndex>,
    ) -> Result<(), Error> {
        let record =
            ExceptionHandler::new(&mut self.instructions, start, end, handler, catch_type)?;
        self.exception_handlers.push(record);
        Ok(())
    }

    /// Remove an exception handler, releasing its hold on the instructions it references
    pub fn remove_exception_handler(&mut self, index: usize) -> Option<ExceptionHandler> {
        if index >= self.exception_handlers.len() {
            return None;
        }
        let record = self.exception_handlers.remove(index);
        record.release(&mut self.instructions);
        Some(record)
    }

    pub fn add_local_variable(
        &mut self,
        start: InsnHandle,
        end: InsnHandle,
        name: impl Into<String>,
        descriptor: impl Into<String>,
        index: u16,
    ) -> Result<(), Error> {
        let record =
            LocalVariable::new(&mut self.instructions, start, end, name, descriptor, index)?;
        self.local_variables.push(record);
        Ok(())
    }

    pub fn add_line_number(&mut self, handle: InsnHandle, line: u16) -> Result<(), Error> {
        let record = LineNumber::new(&mut self.instructions, handle, line)?;
        self.line_numbers.push(record);
        Ok(())
    }

    /// Make everything referencing `old` (branches and records) reference `new` instead
    pub fn redirect_all(&mut self, old: InsnHandle, new: InsnHandle) -> Result<(), Error> {
        let list = &mut self.instructions;
        list.redirect_branches(old, new)?;
        list.redirect_exception_handlers(&mut self.exception_handlers, old, new)?;
        list.redirect_local_variables(&mut self.local_variables, old, new)?;
        list.redirect_line_numbers(&mut self.line_numbers, old, new)?;
        Ok(())
    }

    /// Delete the instructions from `start` to `end` (inclusive), moving anything still
    /// referencing them over to `replacement`
    pub fn delete_redirecting(
        &mut self,
        start: InsnHandle,
        end: InsnHandle,
        replacement: InsnHandle,
    ) -> Result<(), Error> {
        let mut cursor = Some(start);
        while let Some(handle) = cursor {
            if handle == replacement {
                return Err(Error::DetachedHandle(replacement));
            }
            if handle == end {
                break;
            }
            cursor = self.instructions.next(handle)?;
        }

        match self.instructions.delete_range(start, end) {
            Err(Error::TargetLost(lost)) => {
                for handle in lost {
                    self.redirect_all(handle, replacement)?;
                    self.instructions.delete(handle)?;
                }
                Ok(())
            }
            other => other,
        }
    }

    /// Move the instructions (and records) of another method body to the end of this one
    pub fn append_code(&mut self, mut other: MethodCode) -> Result<HandleMap, Error> {
        let map = self.instructions.append_list(&mut other.instructions)?;
        for mut record in other.exception_handlers {
            record.remap(&map);
            self.exception_handlers.push(record);
        }
        for mut record in other.local_variables {
            record.remap(&map);
            self.local_variables.push(record);
        }
        for mut record in other.line_numbers {
            record.remap(&map);
            self.line_numbers.push(record);
        }
        Ok(map)
    }

    /// Lay out the method body and compute everything needed to serialize it
    ///
    ///   * `method` - signature of the method (to seed the frame on entry)
    ///   * `constants` - resolves instruction operands, and receives class names used in frames
    ///   * `hierarchy` - used to join object types where control flow merges
    ///
    pub fn generate(
        &mut self,
        method: &MethodContext,
        constants: &mut impl ConstantPool,
        hierarchy: &dyn ClassHierarchy,
    ) -> Result<GeneratedCode, Error> {
        self.instructions.set_positions(true)?;
        let code = self.instructions.encode()?;

        let list = &self.instructions;
        let cfg = ControlFlowGraph::partition(list, &self.exception_handlers)?;
        let frames = infer_frames(
            list,
            &cfg,
            &self.exception_handlers,
            method,
            &*constants,
            hierarchy,
        )?;
        let stack_map = stack_map_table(list, &cfg, &frames, constants)?;

        let exception_table = self
            .exception_handlers
            .iter()
            .map(|handler| handler.resolve(list))
            .collect::<Result<Vec<_>, Error>>()?;
        let line_numbers = self
            .line_numbers
            .iter()
            .map(|line| line.resolve(list))
            .collect::<Result<Vec<_>, Error>>()?;
        let local_variables = self
            .local_variables
            .iter()
            .map(|variable| variable.resolve(list, constants))
            .collect::<Result<Vec<_>, Error>>()?;

        log::debug!(
            "Generated {} bytes of code for {}{} ({} stack map frames)",
            code.len(),
            method.name,
            method.descriptor.render(),
            stack_map.0.len()
        );
        Ok(GeneratedCode {
            code,
            max_stack: frames.max_stack,
            max_locals: frames.max_locals,
            exception_table,
            line_numbers: LineNumberTable(line_numbers),
            local_variables: LocalVariableTable(local_variables),
            stack_map,
        })
    }
}

impl GeneratedCode {
    /// Assemble a `Code` attribute, registering the names of the nested attributes
    ///
    /// Empty tables are left out.
    pub fn into_code_attribute(self, constants: &mut impl ConstantPool) -> Result<Code, Error> {
        let mut attributes = vec![];
        if !self.stack_map.0.is_empty() {
            attributes.push(Attribute::new(&self.stack_map, constants)?);
        }
        if !self.line_numbers.0.is_empty() {
            attributes.push(Attribute::new(&self.line_numbers, constants)?);
        }
        if !self.local_variables.0.is_empty() {
            attributes.push(Attribute::new(&self.local_variables, constants)?);
        }

        Ok(Code {
            max_stack: self.max_stack,
            max_locals: self.max_locals,
            code_array: BytecodeArray(self.code),
            exception_table: self.exception_table,
            attributes,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::class_file::{ConstantsPool, Serialize};
    use crate::jvm::class_graph::ClassTree;
    use crate::jvm::code::{BranchInstruction, Instruction, Targeter};
    use crate::jvm::{MethodAccessFlags, MethodDescriptor, ParseDescriptor};

    fn static_method(descriptor: &str) -> MethodContext {
        MethodContext::new(
            "me/alec/Test",
            "test",
            MethodDescriptor::parse(descriptor).unwrap(),
            MethodAccessFlags::STATIC,
        )
    }

    #[test]
    fn records_follow_redirects() {
        let mut list = InstructionList::new();
        let a = list.append(Instruction::IConst0).unwrap();
        let b = list.append(Instruction::Pop).unwrap();
        let c = list.append(BranchInstruction::Return).unwrap();
        let mut code = MethodCode::new(list);
        code.add_line_number(b, 12).unwrap();
        code.add_local_variable(a, b, "x", "I", 0).unwrap();

        code.delete_redirecting(b, b, c).unwrap();
        assert!(!code.instructions.contains(b));
        assert_eq!(code.line_numbers[0].handle(), c);
        assert_eq!(code.local_variables[0].end(), c);
        assert_eq!(code.instructions.targeters(c).unwrap().len(), 2);

        assert!(matches!(
            code.delete_redirecting(a, c, c),
            Err(Error::DetachedHandle(_))
        ));
        assert_eq!(code.instructions.len(), 2);
    }

    #[test]
    fn removed_handlers_release_their_targets() {
        let mut list = InstructionList::new();
        let a = list.append(Instruction::Nop).unwrap();
        let b = list.append(BranchInstruction::Return).unwrap();
        let mut code = MethodCode::new(list);
        code.add_exception_handler(a, a, b, None).unwrap();
        let targeter = code.exception_handlers[0].targeter();
        assert!(code.instructions.targeters(b).unwrap().contains(&targeter));

        assert!(code.remove_exception_handler(1).is_none());
        let removed = code.remove_exception_handler(0).unwrap();
        assert_eq!(removed.handler(), b);
        assert!(code.instructions.targeters(a).unwrap().is_empty());
        assert!(code.instructions.targeters(b).unwrap().is_empty());
        code.instructions.delete(a).unwrap();
    }

    #[test]
    fn appended_code_keeps_its_records() {
        let mut first = InstructionList::new();
        first.append(Instruction::Nop).unwrap();
        let mut code = MethodCode::new(first);

        let mut second = InstructionList::new();
        let line_start = second.append(Instruction::IConst0).unwrap();
        second.append(BranchInstruction::IReturn).unwrap();
        let mut other = MethodCode::new(second);
        other.add_line_number(line_start, 3).unwrap();

        let map = code.append_code(other).unwrap();
        let moved = map[&line_start];
        assert_eq!(code.instructions.len(), 3);
        assert_eq!(code.line_numbers[0].handle(), moved);
        assert!(code
            .instructions
            .targeters(moved)
            .unwrap()
            .contains(&code.line_numbers[0].targeter()));
        assert!(!code
            .instructions
            .targeters(moved)
            .unwrap()
            .iter()
            .any(Targeter::is_branch));
    }

    #[test]
    fn decoded_exception_tables() {
        // iconst_0; ireturn; astore_0; iconst_1; ireturn
        let bytes = [0x03, 0xac, 0x4b, 0x04, 0xac];
        let table = [ExceptionTableEntry {
            start_pc: 0,
            end_pc: 2,
            handler_pc: 2,
            catch_type: 0,
        }];
        let mut code = MethodCode::from_bytes(&bytes, &table).unwrap();
        assert_eq!(code.exception_handlers.len(), 1);
        let handler = &code.exception_handlers[0];
        assert_eq!(handler.start(), code.instructions.first().unwrap());
        assert_eq!(handler.catch_type(), None);

        let mut constants = ConstantsPool::new();
        let generated = code
            .generate(&static_method("()I"), &mut constants, &ClassTree::new())
            .unwrap();
        assert_eq!(generated.code, bytes.to_vec());
        assert_eq!(generated.exception_table, table.to_vec());
        assert_eq!(generated.max_stack, 1);
        assert_eq!(generated.max_locals, 1);
        assert_eq!(generated.stack_map.0.len(), 2);

        let bad = [ExceptionTableEntry {
            start_pc: 0,
            end_pc: 6,
            handler_pc: 2,
            catch_type: 0,
        }];
        assert!(matches!(
            MethodCode::from_bytes(&bytes, &bad),
            Err(Error::InvalidExceptionRange { end_pc: 6, .. })
        ));
    }

    #[test]
    fn code_attribute_leaves_out_empty_tables() {
        let mut list = InstructionList::new();
        let ret = list.append(BranchInstruction::Return).unwrap();
        let mut code = MethodCode::new(list);
        code.add_line_number(ret, 1).unwrap();

        let mut constants = ConstantsPool::new();
        let generated = code
            .generate(&static_method("()V"), &mut constants, &ClassTree::new())
            .unwrap();
        assert!(generated.stack_map.0.is_empty());
        let attribute = generated.into_code_attribute(&mut constants).unwrap();
        assert_eq!(attribute.attributes.len(), 1);
        assert_eq!(
            constants.get_utf8(attribute.attributes[0].name_index),
            Some("LineNumberTable")
        );

        let mut bytes = vec![];
        attribute.serialize(&mut bytes).unwrap();
        assert_eq!(&bytes[0..9], &[0, 0, 0, 0, 0, 0, 0, 1, 0xb1]);
    }
}
