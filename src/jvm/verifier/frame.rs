use super::VerificationType;
use crate::jvm::class_file::{Constant, ConstantIndex, ConstantPool};
use crate::jvm::class_graph::{join_ref_types, ClassHierarchy};
use crate::jvm::code::{BranchInstruction, InsnHandle, Instruction, InvokeType};
use crate::jvm::{
    BaseType, FieldType, MethodContext, MethodDescriptor, ParseDescriptor, RefType,
    RenderDescriptor, VerifierErrorKind, INIT_NAME,
};
use crate::util::{OffsetVec, Width};
use std::collections::BTreeMap;
use std::convert::TryFrom;

/// Verification type while frames are being inferred
///
/// Uninitialized objects are identified by the handle of the `new` instruction which created them,
/// since their offset is only known once the list is laid out.
pub type VType = VerificationType<RefType, InsnHandle>;

/// A frame represents the state of the stack and local variables at any location in the bytecode
///
/// In order to load bytecode into the JVM, the JVM requires that methods be annotated with
/// `StackMapTable` attributes to describe the state of the frame at offsets that can be jumped to.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct Frame {
    /// Local variables in the frame, by index
    ///
    /// Missing entries are unusable (`Top`). A `long` or `double` at index `n` implicitly also
    /// occupies index `n + 1`, which is never present in the map.
    pub locals: BTreeMap<u16, VType>,

    /// Stack in the frame
    pub stack: OffsetVec<VType>,
}

impl Frame {
    /// Frame on entry to a method: empty stack and the parameters in the locals
    pub fn entry(method: &MethodContext) -> Result<Frame, VerifierErrorKind> {
        let mut locals = BTreeMap::new();
        let mut next_local: usize = 0;
        if !method.is_static() {
            let this_type = if method.is_constructor() {
                VerificationType::UninitializedThis
            } else {
                VerificationType::Object(method.this_type())
            };
            locals.insert(0, this_type);
            next_local = 1;
        }
        for parameter in &method.descriptor.parameters {
            let index =
                u16::try_from(next_local).map_err(|_| VerifierErrorKind::InvalidIndex(u16::MAX))?;
            next_local += parameter.width();
            locals.insert(index, VType::from(parameter.clone()));
        }
        Ok(Frame {
            locals,
            stack: OffsetVec::new(),
        })
    }

    /// Number of local slots in use (including the second slot of a trailing `long`/`double`)
    pub fn locals_len(&self) -> usize {
        self.locals
            .iter()
            .next_back()
            .map_or(0, |(index, typ)| *index as usize + typ.width())
    }

    /// Frame seen by an exception handler for a given exception type
    pub fn exception_frame(&self, exception_type: RefType) -> Frame {
        let mut stack = OffsetVec::new();
        stack.push(VerificationType::Object(exception_type));
        Frame {
            locals: self.locals.clone(),
            stack,
        }
    }

    /// Update the frame to reflect the effects of the given (non-branching) instruction
    ///
    ///   * `handle` - used to identify the objects created by `new`
    ///   * `method` - used to determine the type of `UninitializedThis` after `<init>`
    ///   * `constants` - used to find out types of constants, fields, and methods
    ///
    pub fn interpret_instruction(
        &mut self,
        insn: &Instruction,
        handle: InsnHandle,
        method: &MethodContext,
        constants: &impl ConstantPool,
    ) -> Result<(), VerifierErrorKind> {
        interpret_instruction(self, insn, handle, method, constants)
    }

    /// Update the frame to reflect the effects of the given branching instruction
    pub fn interpret_branch_instruction<Lbl>(
        &mut self,
        insn: &BranchInstruction<Lbl>,
        method: &MethodContext,
    ) -> Result<(), VerifierErrorKind> {
        interpret_branch_instruction(self, &method.descriptor.return_type, insn)
    }

    /// Least upper bound of two frames reaching the same instruction
    ///
    /// Locals which disagree become unusable, but values on the stack have to agree.
    pub fn join(
        &self,
        other: &Frame,
        hierarchy: &dyn ClassHierarchy,
    ) -> Result<Frame, VerifierErrorKind> {
        if self.stack.len() != other.stack.len() {
            return Err(VerifierErrorKind::StackHeightMismatch(
                self.stack.offset_len().0,
                other.stack.offset_len().0,
            ));
        }

        let mut stack = OffsetVec::new();
        for ((_, _, typ1), (_, _, typ2)) in self.stack.iter().zip(other.stack.iter()) {
            match join_types(typ1, typ2, hierarchy) {
                Some(joined) => {
                    stack.push(joined);
                }
                None => {
                    return Err(VerifierErrorKind::IncompatibleStack(
                        typ1.clone(),
                        typ2.clone(),
                    ))
                }
            }
        }

        let locals = self
            .locals
            .iter()
            .filter_map(|(index, typ1)| {
                let typ2 = other.locals.get(index)?;
                join_types(typ1, typ2, hierarchy).map(|joined| (*index, joined))
            })
            .collect();

        Ok(Frame { locals, stack })
    }
}

/// Least upper bound of two verification types, if it is usable
fn join_types(typ1: &VType, typ2: &VType, hierarchy: &dyn ClassHierarchy) -> Option<VType> {
    use VerificationType::*;

    match (typ1, typ2) {
        _ if typ1 == typ2 => Some(typ1.clone()),
        (Null, Object(ref_type)) | (Object(ref_type), Null) => Some(Object(ref_type.clone())),
        (Object(ref1), Object(ref2)) => Some(Object(join_ref_types(hierarchy, ref1, ref2))),
        _ => None,
    }
}

/// Check if one verification type can be used where another is expected
///
/// Object types are not checked against the class hierarchy: any object (or `null`) is accepted
/// where an object is expected.
fn is_assignable(sub_type: &VType, super_type: &VType) -> bool {
    use VerificationType::*;

    match (sub_type, super_type) {
        _ if sub_type == super_type => true,
        (Null | Object(_), Object(_)) => true,
        _ => false,
    }
}

fn interpret_instruction(
    frame: &mut Frame,
    insn: &Instruction,
    handle: InsnHandle,
    method: &MethodContext,
    constants: &impl ConstantPool,
) -> Result<(), VerifierErrorKind> {
    use Instruction::*;
    use VerificationType::*;

    let Frame {
        ref mut stack,
        ref mut locals,
    } = frame;

    match insn {
        Nop => (),
        AConstNull => {
            stack.push(Null);
        }
        IConstM1 | IConst0 | IConst1 | IConst2 | IConst3 | IConst4 | IConst5 => {
            stack.push(Integer);
        }
        LConst0 | LConst1 => {
            stack.push(Long);
        }
        FConst0 | FConst1 | FConst2 => {
            stack.push(Float);
        }
        DConst0 | DConst1 => {
            stack.push(Double);
        }
        BiPush(_) | SiPush(_) => {
            stack.push(Integer);
        }
        Ldc(index) => {
            let typ = match constants.get(*index) {
                Some(Constant::Integer(_)) => Integer,
                Some(Constant::Float(_)) => Float,
                Some(Constant::String(_)) => Object(RefType::object(RefType::STRING_NAME)),
                Some(Constant::Class(_)) => Object(RefType::object(RefType::CLASS_NAME)),
                Some(Constant::MethodHandle { .. }) => {
                    Object(RefType::object(RefType::METHOD_HANDLE_NAME))
                }
                Some(Constant::MethodType { .. }) => {
                    Object(RefType::object(RefType::METHOD_TYPE_NAME))
                }
                Some(_) => return Err(VerifierErrorKind::NotLoadableConstant(*index)),
                None => return Err(VerifierErrorKind::MissingConstant(*index)),
            };
            stack.push(typ);
        }
        Ldc2(index) => {
            let typ = match constants.get(*index) {
                Some(Constant::Long(_)) => Long,
                Some(Constant::Double(_)) => Double,
                Some(_) => return Err(VerifierErrorKind::NotLoadableConstant(*index)),
                None => return Err(VerifierErrorKind::MissingConstant(*index)),
            };
            stack.push(typ);
        }

        ILoad(index) => {
            get_local_expecting_type(locals, *index, Integer)?;
            stack.push(Integer);
        }
        LLoad(index) => {
            get_local_expecting_type(locals, *index, Long)?;
            stack.push(Long);
        }
        FLoad(index) => {
            get_local_expecting_type(locals, *index, Float)?;
            stack.push(Float);
        }
        DLoad(index) => {
            get_local_expecting_type(locals, *index, Double)?;
            stack.push(Double);
        }
        ALoad(index) => {
            let typ = get_local(locals, *index)?;
            if !typ.is_reference() {
                return Err(VerifierErrorKind::InvalidType);
            }
            stack.push(typ);
        }

        IALoad => {
            pop_offset_vec_expecting_type(stack, Integer)?;
            pop_primitive_array(stack, &[BaseType::Int])?;
            stack.push(Integer);
        }
        LALoad => {
            pop_offset_vec_expecting_type(stack, Integer)?;
            pop_primitive_array(stack, &[BaseType::Long])?;
            stack.push(Long);
        }
        FALoad => {
            pop_offset_vec_expecting_type(stack, Integer)?;
            pop_primitive_array(stack, &[BaseType::Float])?;
            stack.push(Float);
        }
        DALoad => {
            pop_offset_vec_expecting_type(stack, Integer)?;
            pop_primitive_array(stack, &[BaseType::Double])?;
            stack.push(Double);
        }
        AALoad => {
            pop_offset_vec_expecting_type(stack, Integer)?;
            let element_type = match pop_offset_vec(stack)? {
                Null => Null,
                Object(array_type) => match array_type.component_type() {
                    Some(FieldType::Ref(component_type)) => Object(component_type),
                    _ => return Err(VerifierErrorKind::NotArrayType),
                },
                _ => return Err(VerifierErrorKind::NotArrayType),
            };
            stack.push(element_type);
        }
        BALoad => {
            pop_offset_vec_expecting_type(stack, Integer)?;
            pop_primitive_array(stack, &[BaseType::Byte, BaseType::Boolean])?;
            stack.push(Integer);
        }
        CALoad => {
            pop_offset_vec_expecting_type(stack, Integer)?;
            pop_primitive_array(stack, &[BaseType::Char])?;
            stack.push(Integer);
        }
        SALoad => {
            pop_offset_vec_expecting_type(stack, Integer)?;
            pop_primitive_array(stack, &[BaseType::Short])?;
            stack.push(Integer);
        }

        IStore(index) => {
            pop_offset_vec_expecting_type(stack, Integer)?;
            update_local_type(locals, *index, Integer)?;
        }
        FStore(index) => {
            pop_offset_vec_expecting_type(stack, Float)?;
            update_local_type(locals, *index, Float)?;
        }
        LStore(index) => {
            pop_offset_vec_expecting_type(stack, Long)?;
            update_local_type(locals, *index, Long)?;
        }
        DStore(index) => {
            pop_offset_vec_expecting_type(stack, Double)?;
            update_local_type(locals, *index, Double)?;
        }
        AStore(index) => {
            let popped_type = pop_offset_vec(stack)?;
            if !popped_type.is_reference() {
                return Err(VerifierErrorKind::InvalidType);
            }
            update_local_type(locals, *index, popped_type)?;
        }

        IAStore => {
            pop_offset_vec_expecting_type(stack, Integer)?;
            pop_offset_vec_expecting_type(stack, Integer)?;
            pop_primitive_array(stack, &[BaseType::Int])?;
        }
        LAStore => {
            pop_offset_vec_expecting_type(stack, Long)?;
            pop_offset_vec_expecting_type(stack, Integer)?;
            pop_primitive_array(stack, &[BaseType::Long])?;
        }
        FAStore => {
            pop_offset_vec_expecting_type(stack, Float)?;
            pop_offset_vec_expecting_type(stack, Integer)?;
            pop_primitive_array(stack, &[BaseType::Float])?;
        }
        DAStore => {
            pop_offset_vec_expecting_type(stack, Double)?;
            pop_offset_vec_expecting_type(stack, Integer)?;
            pop_primitive_array(stack, &[BaseType::Double])?;
        }
        AAStore => {
            let element_type = pop_offset_vec(stack)?;
            pop_offset_vec_expecting_type(stack, Integer)?;
            let array_type = pop_offset_vec(stack)?;
            let is_object_array = match &array_type {
                Null => true,
                Object(array_type) => {
                    matches!(array_type.component_type(), Some(FieldType::Ref(_)))
                }
                _ => false,
            };
            if !is_object_array {
                return Err(VerifierErrorKind::NotArrayType);
            }
            if !element_type.is_reference() {
                return Err(VerifierErrorKind::InvalidType);
            }
        }
        BAStore => {
            pop_offset_vec_expecting_type(stack, Integer)?;
            pop_offset_vec_expecting_type(stack, Integer)?;
            pop_primitive_array(stack, &[BaseType::Byte, BaseType::Boolean])?;
        }
        CAStore => {
            pop_offset_vec_expecting_type(stack, Integer)?;
            pop_offset_vec_expecting_type(stack, Integer)?;
            pop_primitive_array(stack, &[BaseType::Char])?;
        }
        SAStore => {
            pop_offset_vec_expecting_type(stack, Integer)?;
            pop_offset_vec_expecting_type(stack, Integer)?;
            pop_primitive_array(stack, &[BaseType::Short])?;
        }

        Pop => {
            let _ = pop_offset_vec_expecting_width(stack, 1)?;
        }

        Pop2 => {
            let arg1 = pop_offset_vec(stack)?;
            match arg1.width() {
                // Form 1
                1 => {
                    let _ = pop_offset_vec_expecting_width(stack, 1)?;
                }

                // Form 2
                2 => (),

                other => return Err(VerifierErrorKind::InvalidWidth(other)),
            }
        }

        Dup => {
            let arg1 = pop_offset_vec_expecting_width(stack, 1)?;
            stack.push(arg1.clone());
            stack.push(arg1);
        }

        DupX1 => {
            let arg1 = pop_offset_vec_expecting_width(stack, 1)?;
            let arg2 = pop_offset_vec_expecting_width(stack, 1)?;
            stack.push(arg1.clone());
            stack.push(arg2);
            stack.push(arg1);
        }

        DupX2 => {
            let arg1 = pop_offset_vec_expecting_width(stack, 1)?;
            let arg2 = pop_offset_vec(stack)?;
            match arg2.width() {
                // Form 1
                1 => {
                    let arg3 = pop_offset_vec_expecting_width(stack, 1)?;
                    stack.push(arg1.clone());
                    stack.push(arg3);
                    stack.push(arg2);
                    stack.push(arg1);
                }

                // Form 2
                2 => {
                    stack.push(arg1.clone());
                    stack.push(arg2);
                    stack.push(arg1);
                }

                other => return Err(VerifierErrorKind::InvalidWidth(other)),
            }
        }

        Dup2 => {
            let arg1 = pop_offset_vec(stack)?;
            match arg1.width() {
                // Form 1
                1 => {
                    let arg2 = pop_offset_vec_expecting_width(stack, 1)?;
                    stack.push(arg2.clone());
                    stack.push(arg1.clone());
                    stack.push(arg2);
                    stack.push(arg1);
                }

                // Form 2
                2 => {
                    stack.push(arg1.clone());
                    stack.push(arg1);
                }

                other => return Err(VerifierErrorKind::InvalidWidth(other)),
            }
        }

        Dup2X1 => {
            let arg1 = pop_offset_vec(stack)?;
            match arg1.width() {
                // Form 1
                1 => {
                    let arg2 = pop_offset_vec_expecting_width(stack, 1)?;
                    let arg3 = pop_offset_vec_expecting_width(stack, 1)?;
                    stack.push(arg2.clone());
                    stack.push(arg1.clone());
                    stack.push(arg3);
                    stack.push(arg2);
                    stack.push(arg1);
                }

                // Form 2
                2 => {
                    let arg2 = pop_offset_vec_expecting_width(stack, 1)?;
                    stack.push(arg1.clone());
                    stack.push(arg2);
                    stack.push(arg1);
                }

                other => return Err(VerifierErrorKind::InvalidWidth(other)),
            }
        }

        Dup2X2 => {
            let arg1 = pop_offset_vec(stack)?;
            match arg1.width() {
                1 => {
                    let arg2 = pop_offset_vec_expecting_width(stack, 1)?;
                    let arg3 = pop_offset_vec(stack)?;
                    match arg3.width() {
                        // Form 1
                        1 => {
                            let arg4 = pop_offset_vec_expecting_width(stack, 1)?;
                            stack.push(arg2.clone());
                            stack.push(arg1.clone());
                            stack.push(arg4);
                            stack.push(arg3);
                            stack.push(arg2);
                            stack.push(arg1);
                        }

                        // Form 3
                        2 => {
                            stack.push(arg2.clone());
                            stack.push(arg1.clone());
                            stack.push(arg3);
                            stack.push(arg2);
                            stack.push(arg1);
                        }

                        other => return Err(VerifierErrorKind::InvalidWidth(other)),
                    }
                }

                2 => {
                    let arg2 = pop_offset_vec(stack)?;
                    match arg2.width() {
                        // Form 2
                        1 => {
                            let arg3 = pop_offset_vec_expecting_width(stack, 1)?;
                            stack.push(arg1.clone());
                            stack.push(arg3);
                            stack.push(arg2);
                            stack.push(arg1);
                        }

                        // Form 4
                        2 => {
                            stack.push(arg1.clone());
                            stack.push(arg2);
                            stack.push(arg1);
                        }

                        other => return Err(VerifierErrorKind::InvalidWidth(other)),
                    }
                }

                other => return Err(VerifierErrorKind::InvalidWidth(other)),
            }
        }

        Swap => {
            let arg1 = pop_offset_vec_expecting_width(stack, 1)?;
            let arg2 = pop_offset_vec_expecting_width(stack, 1)?;
            stack.push(arg1);
            stack.push(arg2);
        }

        IAdd | ISub | IDiv | IMul | IRem | IAnd | IOr | IXor | ISh(_) => {
            pop_offset_vec_expecting_type(stack, Integer)?;
            pop_offset_vec_expecting_type(stack, Integer)?;
            stack.push(Integer);
        }
        LAdd | LSub | LDiv | LMul | LRem | LAnd | LOr | LXor => {
            pop_offset_vec_expecting_type(stack, Long)?;
            pop_offset_vec_expecting_type(stack, Long)?;
            stack.push(Long);
        }
        FAdd | FSub | FDiv | FMul | FRem => {
            pop_offset_vec_expecting_type(stack, Float)?;
            pop_offset_vec_expecting_type(stack, Float)?;
            stack.push(Float);
        }
        DAdd | DSub | DDiv | DMul | DRem => {
            pop_offset_vec_expecting_type(stack, Double)?;
            pop_offset_vec_expecting_type(stack, Double)?;
            stack.push(Double);
        }
        INeg | I2B | I2C | I2S => {
            pop_offset_vec_expecting_type(stack, Integer)?;
            stack.push(Integer);
        }
        LNeg => {
            pop_offset_vec_expecting_type(stack, Long)?;
            stack.push(Long);
        }
        FNeg => {
            pop_offset_vec_expecting_type(stack, Float)?;
            stack.push(Float);
        }
        DNeg => {
            pop_offset_vec_expecting_type(stack, Double)?;
            stack.push(Double);
        }
        LSh(_) => {
            pop_offset_vec_expecting_type(stack, Integer)?;
            pop_offset_vec_expecting_type(stack, Long)?;
            stack.push(Long);
        }
        IInc(index, _) => {
            get_local_expecting_type(locals, *index, Integer)?;
        }
        I2L => {
            pop_offset_vec_expecting_type(stack, Integer)?;
            stack.push(Long);
        }
        I2F => {
            pop_offset_vec_expecting_type(stack, Integer)?;
            stack.push(Float);
        }
        I2D => {
            pop_offset_vec_expecting_type(stack, Integer)?;
            stack.push(Double);
        }
        L2I => {
            pop_offset_vec_expecting_type(stack, Long)?;
            stack.push(Integer);
        }
        L2F => {
            pop_offset_vec_expecting_type(stack, Long)?;
            stack.push(Float);
        }
        L2D => {
            pop_offset_vec_expecting_type(stack, Long)?;
            stack.push(Double);
        }
        F2I => {
            pop_offset_vec_expecting_type(stack, Float)?;
            stack.push(Integer);
        }
        F2L => {
            pop_offset_vec_expecting_type(stack, Float)?;
            stack.push(Long);
        }
        F2D => {
            pop_offset_vec_expecting_type(stack, Float)?;
            stack.push(Double);
        }
        D2I => {
            pop_offset_vec_expecting_type(stack, Double)?;
            stack.push(Integer);
        }
        D2L => {
            pop_offset_vec_expecting_type(stack, Double)?;
            stack.push(Long);
        }
        D2F => {
            pop_offset_vec_expecting_type(stack, Double)?;
            stack.push(Float);
        }
        LCmp => {
            pop_offset_vec_expecting_type(stack, Long)?;
            pop_offset_vec_expecting_type(stack, Long)?;
            stack.push(Integer);
        }
        FCmp(_) => {
            pop_offset_vec_expecting_type(stack, Float)?;
            pop_offset_vec_expecting_type(stack, Float)?;
            stack.push(Integer);
        }
        DCmp(_) => {
            pop_offset_vec_expecting_type(stack, Double)?;
            pop_offset_vec_expecting_type(stack, Double)?;
            stack.push(Integer);
        }

        GetStatic(index) => {
            let (_, field_type) = field_info(constants, *index)?;
            stack.push(field_type.into());
        }
        PutStatic(index) => {
            let (_, field_type) = field_info(constants, *index)?;
            let arg_type = pop_offset_vec(stack)?;
            if !is_assignable(&arg_type, &VType::from(field_type)) {
                return Err(VerifierErrorKind::InvalidType);
            }
        }
        GetField(index) => {
            let (_, field_type) = field_info(constants, *index)?;
            let object_type = pop_offset_vec(stack)?;
            if !matches!(object_type, Null | Object(_)) {
                return Err(VerifierErrorKind::InvalidType);
            }
            stack.push(field_type.into());
        }
        PutField(index) => {
            let (_, field_type) = field_info(constants, *index)?;
            let arg_type = pop_offset_vec(stack)?;
            let object_type = pop_offset_vec(stack)?;

            // Fields of `this` can be assigned before the superclass constructor runs
            if !is_assignable(&arg_type, &VType::from(field_type))
                || !matches!(object_type, Null | Object(_) | UninitializedThis)
            {
                return Err(VerifierErrorKind::InvalidType);
            }
        }
        Invoke(invoke_type, index) => {
            let member = constants
                .get_member(*index)
                .ok_or(VerifierErrorKind::MissingConstant(*index))?;
            let desc = MethodDescriptor::parse(member.descriptor)
                .map_err(|_| VerifierErrorKind::BadDescriptor(member.descriptor.to_owned()))?;

            // Check that all the arguments match
            pop_arguments(stack, &desc)?;

            if member.name == INIT_NAME {
                if *invoke_type != InvokeType::Special || desc.return_type.is_some() {
                    return Err(VerifierErrorKind::InvalidType);
                }

                // Initialize every copy of the receiver
                let receiver = pop_offset_vec(stack)?;
                let initialized_type = match &receiver {
                    Uninitialized(_) => Object(class_type(member.class_name)?),
                    UninitializedThis => Object(method.this_type()),
                    _ => return Err(VerifierErrorKind::InvalidType),
                };
                replace_all(stack, locals, &receiver, &initialized_type);
            } else {
                if *invoke_type != InvokeType::Static {
                    let receiver = pop_offset_vec(stack)?;
                    if !matches!(receiver, Null | Object(_)) {
                        log::error!(
                            "Incompatible receiver: found {:?} (for {}.{}{})",
                            receiver,
                            member.class_name,
                            member.name,
                            desc.render(),
                        );
                        return Err(VerifierErrorKind::InvalidType);
                    }
                }

                // Push the return type
                if let Some(return_type) = desc.return_type {
                    stack.push(VType::from(return_type));
                }
            }
        }

        InvokeDynamic(index) => {
            let descriptor = constants
                .get_invoke_dynamic_descriptor(*index)
                .ok_or(VerifierErrorKind::MissingConstant(*index))?;
            let desc = MethodDescriptor::parse(descriptor)
                .map_err(|_| VerifierErrorKind::BadDescriptor(descriptor.to_owned()))?;
            pop_arguments(stack, &desc)?;
            if let Some(return_type) = desc.return_type {
                stack.push(VType::from(return_type));
            }
        }

        New(index) => {
            let class_name = constants
                .get_class_name(*index)
                .ok_or(VerifierErrorKind::MissingConstant(*index))?;
            if class_type(class_name)?.is_array() {
                return Err(VerifierErrorKind::InvalidType);
            }
            stack.push(Uninitialized(handle));
        }
        NewArray(base_type) => {
            pop_offset_vec_expecting_type(stack, Integer)?;
            stack.push(Object(RefType::array(FieldType::Base(*base_type))));
        }
        ANewArray(index) => {
            let class_name = constants
                .get_class_name(*index)
                .ok_or(VerifierErrorKind::MissingConstant(*index))?;
            let element_type = class_type(class_name)?;
            pop_offset_vec_expecting_type(stack, Integer)?;
            stack.push(Object(RefType::array(FieldType::Ref(element_type))));
        }
        MultiANewArray(index, dimensions) => {
            let class_name = constants
                .get_class_name(*index)
                .ok_or(VerifierErrorKind::MissingConstant(*index))?;
            let array_type = class_type(class_name)?;
            if *dimensions == 0 || !array_type.is_array() {
                return Err(VerifierErrorKind::NotArrayType);
            }
            for _ in 0..*dimensions {
                pop_offset_vec_expecting_type(stack, Integer)?;
            }
            stack.push(Object(array_type));
        }
        ArrayLength => {
            match pop_offset_vec(stack)? {
                Null => (),
                Object(array_type) if array_type.is_array() => (),
                _ => return Err(VerifierErrorKind::NotArrayType),
            }
            stack.push(Integer);
        }

        CheckCast(index) => {
            let class_name = constants
                .get_class_name(*index)
                .ok_or(VerifierErrorKind::MissingConstant(*index))?;
            let cast_type = class_type(class_name)?;
            match pop_offset_vec(stack)? {
                Null | Object(_) => (),
                _ => return Err(VerifierErrorKind::InvalidType),
            }
            stack.push(Object(cast_type));
        }
        InstanceOf(index) => {
            constants
                .get_class_name(*index)
                .ok_or(VerifierErrorKind::MissingConstant(*index))?;
            match pop_offset_vec(stack)? {
                Null | Object(_) => (),
                _ => return Err(VerifierErrorKind::InvalidType),
            }
            stack.push(Integer);
        }

        MonitorEnter | MonitorExit => match pop_offset_vec(stack)? {
            Null | Object(_) => (),
            _ => return Err(VerifierErrorKind::InvalidType),
        },
    }

    Ok(())
}

fn interpret_branch_instruction<Lbl>(
    frame: &mut Frame,
    this_method_return_type: &Option<FieldType>,
    insn: &BranchInstruction<Lbl>,
) -> Result<(), VerifierErrorKind> {
    use BranchInstruction::*;
    use VerificationType::*;

    let Frame {
        ref mut stack,
        locals: _,
    } = frame;

    match insn {
        If(_, _) => pop_offset_vec_expecting_type(stack, Integer)?,
        IfICmp(_, _) => {
            pop_offset_vec_expecting_type(stack, Integer)?;
            pop_offset_vec_expecting_type(stack, Integer)?;
        }
        IfACmp(_, _) => {
            let atype_1 = pop_offset_vec(stack)?;
            let atype_2 = pop_offset_vec(stack)?;
            if !atype_1.is_reference() || !atype_2.is_reference() {
                return Err(VerifierErrorKind::InvalidType);
            }
        }
        IfNull(_, _) => {
            let atype = pop_offset_vec(stack)?;
            if !atype.is_reference() {
                return Err(VerifierErrorKind::InvalidType);
            }
        }
        Goto(_) | GotoW(_) => (),
        TableSwitch { .. } | LookupSwitch { .. } => {
            pop_offset_vec_expecting_type(stack, Integer)?
        }
        IReturn => {
            pop_offset_vec_expecting_type(stack, Integer)?;
            match *this_method_return_type {
                Some(FieldType::Base(BaseType::Int))
                | Some(FieldType::Base(BaseType::Char))
                | Some(FieldType::Base(BaseType::Short))
                | Some(FieldType::Base(BaseType::Byte))
                | Some(FieldType::Base(BaseType::Boolean)) => (),
                _ => return Err(VerifierErrorKind::InvalidType),
            }
        }
        LReturn => {
            pop_offset_vec_expecting_type(stack, Long)?;
            if *this_method_return_type != Some(FieldType::long()) {
                return Err(VerifierErrorKind::InvalidType);
            }
        }
        FReturn => {
            pop_offset_vec_expecting_type(stack, Float)?;
            if *this_method_return_type != Some(FieldType::float()) {
                return Err(VerifierErrorKind::InvalidType);
            }
        }
        DReturn => {
            pop_offset_vec_expecting_type(stack, Double)?;
            if *this_method_return_type != Some(FieldType::double()) {
                return Err(VerifierErrorKind::InvalidType);
            }
        }
        AReturn => {
            let atype = pop_offset_vec(stack)?;
            let is_compatible_return = match this_method_return_type {
                Some(ret_type @ FieldType::Ref(_)) => {
                    is_assignable(&atype, &VType::from(ret_type.clone()))
                }
                _ => false,
            };
            if !is_compatible_return {
                return Err(VerifierErrorKind::InvalidType);
            }
        }
        Return => {
            if this_method_return_type.is_some() {
                return Err(VerifierErrorKind::InvalidType);
            }
        }
        AThrow => {
            let atype = pop_offset_vec(stack)?;
            if !matches!(atype, Null | Object(_)) {
                return Err(VerifierErrorKind::InvalidType);
            }
            stack.clear();
            stack.push(atype);
        }
    }

    Ok(())
}

/// Field class and type of a field reference
fn field_info(
    constants: &impl ConstantPool,
    index: ConstantIndex,
) -> Result<(RefType, FieldType), VerifierErrorKind> {
    let member = constants
        .get_member(index)
        .ok_or(VerifierErrorKind::MissingConstant(index))?;
    let field_type = FieldType::parse(member.descriptor)
        .map_err(|_| VerifierErrorKind::BadDescriptor(member.descriptor.to_owned()))?;
    Ok((class_type(member.class_name)?, field_type))
}

fn class_type(class_name: &str) -> Result<RefType, VerifierErrorKind> {
    RefType::from_class_name(class_name)
        .map_err(|_| VerifierErrorKind::BadDescriptor(class_name.to_owned()))
}

/// Pop the arguments of a method call (last argument first)
fn pop_arguments(
    stack: &mut OffsetVec<VType>,
    desc: &MethodDescriptor,
) -> Result<(), VerifierErrorKind> {
    for expected_arg_type in desc.parameters.iter().rev() {
        let expected = VType::from(expected_arg_type.clone());
        let found_arg_type = pop_offset_vec(stack)?;
        if !is_assignable(&found_arg_type, &expected) {
            log::error!(
                "Incompatible argument: found {:?} but expected {:?} (for {})",
                found_arg_type,
                expected,
                desc.render(),
            );
            return Err(VerifierErrorKind::InvalidType);
        }
    }
    Ok(())
}

/// Pop an array whose elements have one of the given primitive types (or `null`)
fn pop_primitive_array(
    stack: &mut OffsetVec<VType>,
    element_types: &[BaseType],
) -> Result<(), VerifierErrorKind> {
    match pop_offset_vec(stack)? {
        VerificationType::Null => Ok(()),
        VerificationType::Object(array_type) => match array_type.component_type() {
            Some(FieldType::Base(base_type)) if element_types.contains(&base_type) => Ok(()),
            _ => Err(VerifierErrorKind::NotArrayType),
        },
        _ => Err(VerifierErrorKind::NotArrayType),
    }
}

fn replace_all(
    stack: &mut OffsetVec<VType>,
    locals: &mut BTreeMap<u16, VType>,
    original: &VType,
    updated: &VType,
) {
    stack.for_each_mut(|typ| {
        if typ == original {
            *typ = updated.clone();
        }
    });
    for typ in locals.values_mut() {
        if typ == original {
            *typ = updated.clone();
        }
    }
}

fn get_local(locals: &BTreeMap<u16, VType>, index: u16) -> Result<VType, VerifierErrorKind> {
    locals
        .get(&index)
        .cloned()
        .ok_or(VerifierErrorKind::InvalidIndex(index))
}

fn get_local_expecting_type(
    locals: &BTreeMap<u16, VType>,
    index: u16,
    expected_type: VType,
) -> Result<(), VerifierErrorKind> {
    if get_local(locals, index)? == expected_type {
        Ok(())
    } else {
        Err(VerifierErrorKind::InvalidType)
    }
}

/// Store into a local, clobbering whatever `long`/`double` it overlaps with
fn update_local_type(
    locals: &mut BTreeMap<u16, VType>,
    index: u16,
    new_type: VType,
) -> Result<(), VerifierErrorKind> {
    if new_type.width() == 2 {
        let second = index
            .checked_add(1)
            .ok_or(VerifierErrorKind::InvalidIndex(index))?;
        locals.remove(&second);
    }
    if let Some(previous) = index.checked_sub(1) {
        if locals.get(&previous).map_or(false, |typ| typ.width() == 2) {
            locals.remove(&previous);
        }
    }
    locals.insert(index, new_type);
    Ok(())
}

fn pop_offset_vec(stack: &mut OffsetVec<VType>) -> Result<VType, VerifierErrorKind> {
    stack
        .pop()
        .map(|(_, _, typ)| typ)
        .ok_or(VerifierErrorKind::EmptyStack)
}

fn pop_offset_vec_expecting_width(
    stack: &mut OffsetVec<VType>,
    expected_width: usize,
) -> Result<VType, VerifierErrorKind> {
    let typ = pop_offset_vec(stack)?;
    let found_width = typ.width();
    if found_width == expected_width {
        Ok(typ)
    } else {
        Err(VerifierErrorKind::InvalidWidth(found_width))
    }
}

fn pop_offset_vec_expecting_type(
    stack: &mut OffsetVec<VType>,
    expected_type: VType,
) -> Result<(), VerifierErrorKind> {
    let typ = pop_offset_vec(stack)?;
    if typ == expected_type {
        Ok(())
    } else {
        Err(VerifierErrorKind::InvalidType)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::class_file::ConstantsPool;
    use crate::jvm::class_graph::ClassTree;
    use crate::jvm::code::InstructionList;
    use crate::jvm::MethodAccessFlags;

    fn method(name: &str, descriptor: &str, access_flags: MethodAccessFlags) -> MethodContext {
        MethodContext::new(
            "me/alec/Point",
            name,
            MethodDescriptor::parse(descriptor).unwrap(),
            access_flags,
        )
    }

    fn some_handle() -> InsnHandle {
        let mut list = InstructionList::new();
        list.append(Instruction::Nop).unwrap()
    }

    #[test]
    fn entry_frames() {
        let frame = Frame::entry(&method("f", "(JI[D)V", MethodAccessFlags::STATIC)).unwrap();
        assert_eq!(frame.locals.get(&0), Some(&VerificationType::Long));
        assert_eq!(frame.locals.get(&1), None);
        assert_eq!(frame.locals.get(&2), Some(&VerificationType::Integer));
        assert_eq!(
            frame.locals.get(&3),
            Some(&VerificationType::Object(RefType::array(FieldType::double())))
        );
        assert_eq!(frame.locals_len(), 4);

        let constructor =
            Frame::entry(&method(INIT_NAME, "(D)V", MethodAccessFlags::PUBLIC)).unwrap();
        assert_eq!(constructor.locals.get(&0), Some(&VerificationType::UninitializedThis));
        assert_eq!(constructor.locals_len(), 3);
    }

    #[test]
    fn stores_clobber_wide_locals() {
        let method = method("f", "()V", MethodAccessFlags::STATIC);
        let pool = ConstantsPool::new();
        let handle = some_handle();
        let mut frame = Frame::default();
        for insn in [
            Instruction::DConst1,
            Instruction::DStore(1),
            Instruction::IConst0,
            Instruction::IStore(2),
        ] {
            frame
                .interpret_instruction(&insn, handle, &method, &pool)
                .unwrap();
        }
        assert_eq!(frame.locals.get(&1), None);
        assert_eq!(frame.locals.get(&2), Some(&VerificationType::Integer));
        assert!(matches!(
            frame.interpret_instruction(&Instruction::DLoad(1), handle, &method, &pool),
            Err(VerifierErrorKind::InvalidIndex(1))
        ));
    }

    #[test]
    fn array_loads_push_element_types() {
        let method = method("f", "([[Ljava/lang/String;)V", MethodAccessFlags::STATIC);
        let pool = ConstantsPool::new();
        let handle = some_handle();
        let mut frame = Frame::entry(&method).unwrap();
        for insn in [
            Instruction::ALoad(0),
            Instruction::IConst0,
            Instruction::AALoad,
            Instruction::IConst0,
            Instruction::AALoad,
        ] {
            frame
                .interpret_instruction(&insn, handle, &method, &pool)
                .unwrap();
        }
        assert_eq!(
            frame.stack.last(),
            Some(&VerificationType::Object(RefType::object("java/lang/String")))
        );
        assert_eq!(
            frame.interpret_instruction(&Instruction::AALoad, handle, &method, &pool),
            Err(VerifierErrorKind::InvalidType)
        );
    }

    #[test]
    fn constructors_initialize_objects() {
        let mut pool = ConstantsPool::new();
        let point = pool.add_class("me/alec/Point").unwrap();
        let init = pool
            .add_method_ref("me/alec/Point", INIT_NAME, "(I)V", false)
            .unwrap();
        let method = method("make", "()Lme/alec/Point;", MethodAccessFlags::STATIC);
        let new_handle = some_handle();

        let mut frame = Frame::default();
        for insn in [
            Instruction::New(point),
            Instruction::Dup,
            Instruction::IConst1,
        ] {
            frame
                .interpret_instruction(&insn, new_handle, &method, &pool)
                .unwrap();
        }
        assert_eq!(frame.stack.last(), Some(&VerificationType::Integer));
        frame
            .interpret_instruction(
                &Instruction::Invoke(InvokeType::Special, init),
                new_handle,
                &method,
                &pool,
            )
            .unwrap();
        assert_eq!(frame.stack.len(), 1);
        assert_eq!(
            frame.stack.last(),
            Some(&VerificationType::Object(RefType::object("me/alec/Point")))
        );
        frame
            .interpret_branch_instruction(&BranchInstruction::<()>::AReturn, &method)
            .unwrap();
    }

    #[test]
    fn bad_instructions() {
        let method = method("f", "()I", MethodAccessFlags::STATIC);
        let pool = ConstantsPool::new();
        let handle = some_handle();
        let mut frame = Frame::default();
        assert_eq!(
            frame.interpret_instruction(&Instruction::Pop, handle, &method, &pool),
            Err(VerifierErrorKind::EmptyStack)
        );
        assert_eq!(
            frame.interpret_instruction(
                &Instruction::Ldc(ConstantIndex(4)),
                handle,
                &method,
                &pool
            ),
            Err(VerifierErrorKind::MissingConstant(ConstantIndex(4)))
        );
        frame.stack.push(VerificationType::Float);
        assert_eq!(
            frame.interpret_branch_instruction(&BranchInstruction::<()>::IReturn, &method),
            Err(VerifierErrorKind::InvalidType)
        );
    }

    #[test]
    fn joins() {
        let tree = ClassTree::new();
        let mut frame1 = Frame::default();
        frame1.locals.insert(0, VerificationType::Integer);
        frame1.locals.insert(1, VerificationType::Null);
        frame1
            .stack
            .push(VerificationType::Object(RefType::object("java/lang/Integer")));
        let mut frame2 = Frame::default();
        frame2.locals.insert(0, VerificationType::Float);
        frame2
            .locals
            .insert(1, VerificationType::Object(RefType::object("java/lang/String")));
        frame2
            .stack
            .push(VerificationType::Object(RefType::object("java/lang/Long")));

        let joined = frame1.join(&frame2, &tree).unwrap();
        assert_eq!(joined.locals.get(&0), None);
        assert_eq!(
            joined.locals.get(&1),
            Some(&VerificationType::Object(RefType::object("java/lang/String")))
        );
        assert_eq!(
            joined.stack.last(),
            Some(&VerificationType::Object(RefType::object("java/lang/Number")))
        );

        frame2.stack.push(VerificationType::Integer);
        assert_eq!(
            frame1.join(&frame2, &tree),
            Err(VerifierErrorKind::StackHeightMismatch(1, 2))
        );
        frame1.stack.push(VerificationType::Float);
        assert!(matches!(
            frame1.join(&frame2, &tree),
            Err(VerifierErrorKind::IncompatibleStack(
                VerificationType::Float,
                VerificationType::Integer
            ))
        ));
    }
}
