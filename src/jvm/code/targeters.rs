//! Records which point into an instruction list without being instructions themselves
//!
//! Exception handlers, local variable scopes, and line numbers all live outside of the list (they
//! are owned by the surrounding method), but they still need to be found whenever an instruction
//! they reference gets deleted or replaced. Each record therefore registers itself as a
//! [`Targeter`] of every instruction it references, and keeps that registration current when its
//! references change.

use super::{HandleMap, InsnHandle, InstructionList, Targeter, TargeterId};
use crate::jvm::class_file::{
    ConstantIndex, ConstantPool, ExceptionTableEntry, LineNumberEntry, LocalVariableEntry,
};
use crate::jvm::Error;
use crate::util::Offset;
use std::convert::TryFrom;

/// Record holding references to instructions in a list
pub trait InstructionTargeter {
    /// Identity under which the record is registered on its targets
    fn targeter(&self) -> Targeter;

    /// Instructions referenced (possibly with repeats)
    fn targets(&self) -> Vec<InsnHandle>;

    fn contains_target(&self, handle: InsnHandle) -> bool {
        self.targets().contains(&handle)
    }

    /// Replace every reference to `old` with `new` (without touching registrations)
    fn replace_target(&mut self, old: InsnHandle, new: InsnHandle);

    /// Replace every reference to `old` with `new`, returning whether anything changed
    fn update_target(
        &mut self,
        list: &mut InstructionList,
        old: InsnHandle,
        new: InsnHandle,
    ) -> Result<bool, Error> {
        if old == new || !self.contains_target(old) {
            return Ok(false);
        }
        list.node(new)?;
        self.replace_target(old, new);
        list.remove_targeter(old, &self.targeter());
        list.add_targeter(new, self.targeter())?;
        Ok(true)
    }

    /// Point the record at the new handles after its instructions were spliced into another list
    ///
    /// Splicing carries the registrations along, so this only rewrites the references.
    fn remap(&mut self, map: &HandleMap) {
        for old in self.targets() {
            if let Some(new) = map.get(&old) {
                self.replace_target(old, *new);
            }
        }
    }

    /// Drop the registrations of this record (eg. before discarding it)
    fn release(&self, list: &mut InstructionList) {
        let targeter = self.targeter();
        for target in self.targets() {
            list.remove_targeter(target, &targeter);
        }
    }
}

/// Register a new record on all of its targets, which must be linked into the list
fn register(list: &mut InstructionList, record: &impl InstructionTargeter) -> Result<(), Error> {
    let targets = record.targets();
    for target in &targets {
        list.linked(*target)?;
    }
    for target in targets {
        list.add_targeter(target, record.targeter())?;
    }
    Ok(())
}

fn to_u16(offset: Offset) -> Result<u16, Error> {
    u16::try_from(offset.0).map_err(|_| Error::MethodCodeOverflow(offset))
}

/// Protected range of instructions along with the instruction handling exceptions from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    id: TargeterId,

    /// First protected instruction
    start: InsnHandle,

    /// Last protected instruction (inclusive)
    end: InsnHandle,

    /// Start of the handler
    handler: InsnHandle,

    /// Class of exceptions caught (`None` catches everything)
    catch_type: Option<ConstantIndex>,
}

impl ExceptionHandler {
    pub fn new(
        list: &mut InstructionList,
        start: InsnHandle,
        end: InsnHandle,
        handler: InsnHandle,
        catch_type: Option<ConstantIndex>,
    ) -> Result<ExceptionHandler, Error> {
        let record = ExceptionHandler {
            id: TargeterId::fresh(),
            start,
            end,
            handler,
            catch_type,
        };
        register(list, &record)?;
        Ok(record)
    }

    pub fn start(&self) -> InsnHandle {
        self.start
    }

    pub fn end(&self) -> InsnHandle {
        self.end
    }

    pub fn handler(&self) -> InsnHandle {
        self.handler
    }

    pub fn catch_type(&self) -> Option<ConstantIndex> {
        self.catch_type
    }

    pub fn set_catch_type(&mut self, catch_type: Option<ConstantIndex>) {
        self.catch_type = catch_type;
    }

    /// Does the protected range cover the given byte offset? (requires resolved positions)
    pub fn covers(&self, list: &InstructionList, offset: Offset) -> Result<bool, Error> {
        let start = list.position(self.start)?;
        let end = list.end_position(self.end)?;
        Ok(start <= offset && offset < end)
    }

    /// Resolve into an entry of the exception table
    pub fn resolve(&self, list: &InstructionList) -> Result<ExceptionTableEntry, Error> {
        let start_pc = list.position(self.start)?;
        let end_pc = list.end_position(self.end)?;
        if end_pc <= start_pc {
            return Err(Error::InvalidRange {
                start: self.start,
                end: self.end,
            });
        }
        Ok(ExceptionTableEntry {
            start_pc: to_u16(start_pc)?,
            end_pc: to_u16(end_pc)?,
            handler_pc: to_u16(list.position(self.handler)?)?,
            catch_type: self.catch_type.map_or(0, |ConstantIndex(idx)| idx),
        })
    }
}

impl InstructionTargeter for ExceptionHandler {
    fn targeter(&self) -> Targeter {
        Targeter::ExceptionHandler(self.id)
    }

    fn targets(&self) -> Vec<InsnHandle> {
        vec![self.start, self.end, self.handler]
    }

    fn replace_target(&mut self, old: InsnHandle, new: InsnHandle) {
        for target in [&mut self.start, &mut self.end, &mut self.handler] {
            if *target == old {
                *target = new;
            }
        }
    }
}

/// Scope of a local variable (for debug information)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariable {
    id: TargeterId,

    /// First instruction where the variable is in scope
    start: InsnHandle,

    /// Last instruction where the variable is in scope (inclusive)
    end: InsnHandle,

    pub name: String,

    /// Field descriptor of the variable
    pub descriptor: String,

    /// Local variable index
    pub index: u16,
}

impl LocalVariable {
    pub fn new(
        list: &mut InstructionList,
        start: InsnHandle,
        end: InsnHandle,
        name: impl Into<String>,
        descriptor: impl Into<String>,
        index: u16,
    ) -> Result<LocalVariable, Error> {
        let record = LocalVariable {
            id: TargeterId::fresh(),
            start,
            end,
            name: name.into(),
            descriptor: descriptor.into(),
            index,
        };
        register(list, &record)?;
        Ok(record)
    }

    pub fn start(&self) -> InsnHandle {
        self.start
    }

    pub fn end(&self) -> InsnHandle {
        self.end
    }

    pub fn resolve(
        &self,
        list: &InstructionList,
        constants: &mut impl ConstantPool,
    ) -> Result<LocalVariableEntry, Error> {
        let start_pc = list.position(self.start)?;
        let end_pc = list.end_position(self.end)?;
        if end_pc <= start_pc {
            return Err(Error::InvalidRange {
                start: self.start,
                end: self.end,
            });
        }
        Ok(LocalVariableEntry {
            start_pc: to_u16(start_pc)?,
            length: to_u16(Offset(end_pc.0 - start_pc.0))?,
            name_index: constants.add_utf8(&self.name)?,
            descriptor_index: constants.add_utf8(&self.descriptor)?,
            index: self.index,
        })
    }
}

impl InstructionTargeter for LocalVariable {
    fn targeter(&self) -> Targeter {
        Targeter::LocalVariable(self.id)
    }

    fn targets(&self) -> Vec<InsnHandle> {
        vec![self.start, self.end]
    }

    fn replace_target(&mut self, old: InsnHandle, new: InsnHandle) {
        for target in [&mut self.start, &mut self.end] {
            if *target == old {
                *target = new;
            }
        }
    }
}

/// Source line number starting at an instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineNumber {
    id: TargeterId,
    handle: InsnHandle,
    pub line: u16,
}

impl LineNumber {
    pub fn new(
        list: &mut InstructionList,
        handle: InsnHandle,
        line: u16,
    ) -> Result<LineNumber, Error> {
        let record = LineNumber {
            id: TargeterId::fresh(),
            handle,
            line,
        };
        register(list, &record)?;
        Ok(record)
    }

    pub fn handle(&self) -> InsnHandle {
        self.handle
    }

    pub fn resolve(&self, list: &InstructionList) -> Result<LineNumberEntry, Error> {
        Ok(LineNumberEntry {
            start_pc: to_u16(list.position(self.handle)?)?,
            line_number: self.line,
        })
    }
}

impl InstructionTargeter for LineNumber {
    fn targeter(&self) -> Targeter {
        Targeter::LineNumber(self.id)
    }

    fn targets(&self) -> Vec<InsnHandle> {
        vec![self.handle]
    }

    fn replace_target(&mut self, old: InsnHandle, new: InsnHandle) {
        if self.handle == old {
            self.handle = new;
        }
    }
}

fn redirect_records<T: InstructionTargeter>(
    list: &mut InstructionList,
    records: &mut [T],
    old: InsnHandle,
    new: InsnHandle,
) -> Result<(), Error> {
    for record in records {
        record.update_target(list, old, new)?;
    }
    Ok(())
}

impl InstructionList {
    /// Make every exception handler referencing `old` reference `new` instead
    pub fn redirect_exception_handlers(
        &mut self,
        handlers: &mut [ExceptionHandler],
        old: InsnHandle,
        new: InsnHandle,
    ) -> Result<(), Error> {
        redirect_records(self, handlers, old, new)
    }

    /// Make every local variable scope referencing `old` reference `new` instead
    pub fn redirect_local_variables(
        &mut self,
        variables: &mut [LocalVariable],
        old: InsnHandle,
        new: InsnHandle,
    ) -> Result<(), Error> {
        redirect_records(self, variables, old, new)
    }

    /// Make every line number referencing `old` reference `new` instead
    pub fn redirect_line_numbers(
        &mut self,
        line_numbers: &mut [LineNumber],
        old: InsnHandle,
        new: InsnHandle,
    ) -> Result<(), Error> {
        redirect_records(self, line_numbers, old, new)
    }
}
