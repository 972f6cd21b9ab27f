use crate::jvm::class_file::{u16_length, Serialize};
use crate::util::{Offset, OffsetVec, Width};
use byteorder::WriteBytesExt;
use std::collections::HashMap;
use std::result::Result;

/// Index into the constant pool
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ConstantIndex(pub u16);

impl Serialize for ConstantIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

/// Constants as in the constant pool
///
/// Floating point constants are stored as their raw IEEE 754 bits so that constants can be
/// compared and hashed (which is what deduplication in the pool relies on).
///
/// Note: some constant types added after Java 8 are not included (module, package, and dynamic
/// constants)
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.4
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    /// Class or an interface (pointing to the UTF-8 binary name)
    Class(ConstantIndex),

    /// Field (class, name and type)
    FieldRef(ConstantIndex, ConstantIndex),

    /// Method (this combines `Methodref` and `InterfaceMethodref`)
    MethodRef {
        class: ConstantIndex,
        name_and_type: ConstantIndex,
        is_interface: bool,
    },

    /// Constant object of type `java.lang.String`
    String(ConstantIndex),

    /// Constant primitive of type `int`
    Integer(i32),

    /// Constant primitive of type `float` (raw bits)
    Float(u32),

    /// Constant primitive of type `long`
    Long(i64),

    /// Constant primitive of type `double` (raw bits)
    Double(u64),

    /// Name and a type (eg. for a field or a method)
    NameAndType {
        name: ConstantIndex,
        descriptor: ConstantIndex,
    },

    /// Constant UTF-8 encoded raw string value
    ///
    /// Despite the name, the encoding is not quite UTF-8 (see [`encode_modified_utf8`]).
    Utf8(String),

    /// Constant object of type `java.lang.invoke.MethodHandle`
    MethodHandle {
        handle_kind: HandleKind,

        /// `FieldRef` for the field kinds, `MethodRef` for the rest
        member: ConstantIndex,
    },

    /// Method type
    MethodType { descriptor: ConstantIndex },

    /// Dynamically-computed call site
    InvokeDynamic {
        /// Index into the `BootstrapMethods` attribute
        bootstrap_method: u16,
        name_and_type: ConstantIndex,
    },
}

impl Constant {
    pub fn float(value: f32) -> Constant {
        Constant::Float(value.to_bits())
    }

    pub fn double(value: f64) -> Constant {
        Constant::Double(value.to_bits())
    }
}

/// `long` and `double` constants take up two slots in the pool
impl Width for Constant {
    fn width(&self) -> usize {
        match self {
            Constant::Long(_) | Constant::Double(_) => 2,
            _ => 1,
        }
    }
}

impl Serialize for Constant {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        match self {
            Constant::Utf8(string) => {
                1u8.serialize(writer)?;
                let buffer: Vec<u8> = encode_modified_utf8(string);
                u16_length(buffer.len())?.serialize(writer)?;
                writer.write_all(&buffer)?;
            }
            Constant::Integer(integer) => {
                3u8.serialize(writer)?;
                integer.serialize(writer)?;
            }
            Constant::Float(bits) => {
                4u8.serialize(writer)?;
                bits.serialize(writer)?;
            }
            Constant::Long(long) => {
                5u8.serialize(writer)?;
                long.serialize(writer)?;
            }
            Constant::Double(bits) => {
                6u8.serialize(writer)?;
                bits.serialize(writer)?;
            }
            Constant::Class(name) => {
                7u8.serialize(writer)?;
                name.serialize(writer)?;
            }
            Constant::String(utf8) => {
                8u8.serialize(writer)?;
                utf8.serialize(writer)?;
            }
            Constant::FieldRef(class, name_and_type) => {
                9u8.serialize(writer)?;
                class.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Constant::MethodRef {
                class,
                name_and_type,
                is_interface,
            } => {
                (if !is_interface { 10u8 } else { 11u8 }).serialize(writer)?;
                class.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Constant::NameAndType { name, descriptor } => {
                12u8.serialize(writer)?;
                name.serialize(writer)?;
                descriptor.serialize(writer)?;
            }
            Constant::MethodHandle {
                handle_kind,
                member,
            } => {
                15u8.serialize(writer)?;
                handle_kind.serialize(writer)?;
                member.serialize(writer)?;
            }
            Constant::MethodType { descriptor } => {
                16u8.serialize(writer)?;
                descriptor.serialize(writer)?;
            }
            Constant::InvokeDynamic {
                bootstrap_method,
                name_and_type,
            } => {
                18u8.serialize(writer)?;
                bootstrap_method.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
        };
        Ok(())
    }
}

/// Kinds of method handles
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum HandleKind {
    GetField,
    GetStatic,
    PutField,
    PutStatic,
    InvokeVirtual,
    InvokeStatic,
    InvokeSpecial,
    NewInvokeSpecial,
    InvokeInterface,
}

impl Serialize for HandleKind {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        let kind: u8 = match self {
            HandleKind::GetField => 1,
            HandleKind::GetStatic => 2,
            HandleKind::PutField => 3,
            HandleKind::PutStatic => 4,
            HandleKind::InvokeVirtual => 5,
            HandleKind::InvokeStatic => 6,
            HandleKind::InvokeSpecial => 7,
            HandleKind::NewInvokeSpecial => 8,
            HandleKind::InvokeInterface => 9,
        };
        kind.serialize(writer)
    }
}

#[derive(Debug)]
pub struct ConstantPoolOverflow {
    pub constant: Constant,
    pub offset: u16,
}

/// Field or method reference, with all of its indirections resolved
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct MemberInfo<'a> {
    pub class_name: &'a str,
    pub name: &'a str,
    pub descriptor: &'a str,
    pub is_interface: bool,
}

/// Narrow view of a constant pool
///
/// Instructions only hold [`ConstantIndex`] operands. Anything that needs to know what those
/// operands mean (eg. the frame inference needs field types and method signatures) goes through
/// this trait.
pub trait ConstantPool {
    /// Get the constant at an index
    fn get(&self, index: ConstantIndex) -> Option<&Constant>;

    /// Find the index of a constant already in the pool
    fn lookup(&self, constant: &Constant) -> Option<ConstantIndex>;

    /// Get or insert a constant
    fn add(&mut self, constant: Constant) -> Result<ConstantIndex, ConstantPoolOverflow>;

    fn get_utf8(&self, index: ConstantIndex) -> Option<&str> {
        match self.get(index)? {
            Constant::Utf8(string) => Some(string),
            _ => None,
        }
    }

    /// Get the name stored in a `CONSTANT_Class`
    fn get_class_name(&self, index: ConstantIndex) -> Option<&str> {
        match self.get(index)? {
            Constant::Class(name) => self.get_utf8(*name),
            _ => None,
        }
    }

    /// Resolve a name and type constant into the name and descriptor
    fn get_name_and_type(&self, index: ConstantIndex) -> Option<(&str, &str)> {
        match self.get(index)? {
            Constant::NameAndType { name, descriptor } => {
                Some((self.get_utf8(*name)?, self.get_utf8(*descriptor)?))
            }
            _ => None,
        }
    }

    /// Resolve a field, method, or interface method reference
    fn get_member(&self, index: ConstantIndex) -> Option<MemberInfo<'_>> {
        let (class, name_and_type, is_interface) = match self.get(index)? {
            Constant::FieldRef(class, name_and_type) => (*class, *name_and_type, false),
            Constant::MethodRef {
                class,
                name_and_type,
                is_interface,
            } => (*class, *name_and_type, *is_interface),
            _ => return None,
        };
        let (name, descriptor) = self.get_name_and_type(name_and_type)?;
        Some(MemberInfo {
            class_name: self.get_class_name(class)?,
            name,
            descriptor,
            is_interface,
        })
    }

    /// Get the method descriptor of an invoke dynamic call site
    fn get_invoke_dynamic_descriptor(&self, index: ConstantIndex) -> Option<&str> {
        match self.get(index)? {
            Constant::InvokeDynamic { name_and_type, .. } => {
                self.get_name_and_type(*name_and_type).map(|(_, desc)| desc)
            }
            _ => None,
        }
    }

    fn add_utf8(&mut self, utf8: &str) -> Result<ConstantIndex, ConstantPoolOverflow> {
        self.add(Constant::Utf8(utf8.to_owned()))
    }

    fn add_class(&mut self, name: &str) -> Result<ConstantIndex, ConstantPoolOverflow> {
        let name = self.add_utf8(name)?;
        self.add(Constant::Class(name))
    }

    fn add_name_and_type(
        &mut self,
        name: &str,
        descriptor: &str,
    ) -> Result<ConstantIndex, ConstantPoolOverflow> {
        let name = self.add_utf8(name)?;
        let descriptor = self.add_utf8(descriptor)?;
        self.add(Constant::NameAndType { name, descriptor })
    }

    fn add_field_ref(
        &mut self,
        class_name: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<ConstantIndex, ConstantPoolOverflow> {
        let class = self.add_class(class_name)?;
        let name_and_type = self.add_name_and_type(name, descriptor)?;
        self.add(Constant::FieldRef(class, name_and_type))
    }

    fn add_method_ref(
        &mut self,
        class_name: &str,
        name: &str,
        descriptor: &str,
        is_interface: bool,
    ) -> Result<ConstantIndex, ConstantPoolOverflow> {
        let class = self.add_class(class_name)?;
        let name_and_type = self.add_name_and_type(name, descriptor)?;
        self.add(Constant::MethodRef {
            class,
            name_and_type,
            is_interface,
        })
    }
}

/// In-memory, append-only constant pool
///
/// Constants are deduplicated: adding a constant which is already in the pool returns the index
/// of the existing entry. Indexing starts at 1 and `long`/`double` constants take two indices.
#[derive(Debug, Clone)]
pub struct ConstantsPool {
    constants: OffsetVec<Constant>,
    indices: HashMap<Constant, ConstantIndex>,
}

impl ConstantsPool {
    /// Make a fresh empty constants pool
    pub fn new() -> ConstantsPool {
        ConstantsPool {
            constants: OffsetVec::new_starting_at(Offset(1)),
            indices: HashMap::new(),
        }
    }

    /// Number of constants in the pool
    pub fn len(&self) -> usize {
        self.constants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    /// Push a constant into the constant pool, provided there is space for it
    ///
    /// Note: the pool count is a `u16` one larger than the largest index, indexing starts at 1,
    /// and some constants take two spaces.
    fn push_constant(&mut self, constant: Constant) -> Result<ConstantIndex, ConstantPoolOverflow> {
        let offset = self.constants.offset_len().0;

        if offset + constant.width() > u16::MAX as usize {
            return Err(ConstantPoolOverflow {
                constant,
                offset: offset as u16,
            });
        }

        self.indices.insert(constant.clone(), ConstantIndex(offset as u16));
        self.constants.push(constant);
        Ok(ConstantIndex(offset as u16))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConstantIndex, &Constant)> {
        self.constants
            .iter()
            .map(|(offset, _, constant)| (ConstantIndex(offset.0 as u16), constant))
    }
}

impl Default for ConstantsPool {
    fn default() -> Self {
        ConstantsPool::new()
    }
}

impl ConstantPool for ConstantsPool {
    fn get(&self, index: ConstantIndex) -> Option<&Constant> {
        self.constants.get_offset(Offset(index.0 as usize)).ok()
    }

    fn lookup(&self, constant: &Constant) -> Option<ConstantIndex> {
        self.indices.get(constant).copied()
    }

    fn add(&mut self, constant: Constant) -> Result<ConstantIndex, ConstantPoolOverflow> {
        match self.lookup(&constant) {
            Some(index) => Ok(index),
            None => self.push_constant(constant),
        }
    }
}

/// The pool serializes with its count (one more than the largest index) first
impl Serialize for ConstantsPool {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        (self.constants.offset_len().0 as u16).serialize(writer)?;
        for (_, _, constant) in &self.constants {
            constant.serialize(writer)?;
        }
        Ok(())
    }
}

/// Modified UTF-8 format used in class files.
///
/// See [this `DataInput` section for details][0]:
///
///  * The null character `\u0000` is encoded in 2-byte format rather than 1-byte, so that the
///    encoded strings never have embedded nulls.
///  * Only the 1-byte, 2-byte, and 3-byte formats are used.
///  * Supplementary characters are represented in the form of surrogate pairs.
///
/// [0]: https://docs.oracle.com/en/java/javase/17/docs/api/java.base/java/io/DataInput.html#modified-utf-8
pub fn encode_modified_utf8(string: &str) -> Vec<u8> {
    let mut buffer: Vec<u8> = vec![];
    for unit in string.encode_utf16() {
        match unit {
            0x0001..=0x007F => buffer.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                buffer.push((unit >> 6 & 0x1F) as u8 | 0b1100_0000);
                buffer.push((unit & 0x3F) as u8 | 0b1000_0000);
            }
            _ => {
                buffer.push((unit >> 12 & 0x0F) as u8 | 0b1110_0000);
                buffer.push((unit >> 6 & 0x3F) as u8 | 0b1000_0000);
                buffer.push((unit & 0x3F) as u8 | 0b1000_0000);
            }
        }
    }
    buffer
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deduplicated_and_one_based() {
        let mut pool = ConstantsPool::new();
        let first = pool.add_class("java/lang/Object").unwrap();
        let again = pool.add_class("java/lang/Object").unwrap();
        assert_eq!(first, again);
        assert_eq!(pool.get_class_name(first), Some("java/lang/Object"));

        // The UTF-8 name went in first
        assert_eq!(pool.get(ConstantIndex(1)), Some(&Constant::Utf8("java/lang/Object".into())));
        assert_eq!(first, ConstantIndex(2));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn wide_constants_take_two_indices() {
        let mut pool = ConstantsPool::new();
        let long = pool.add(Constant::Long(7)).unwrap();
        let double = pool.add(Constant::double(1.5)).unwrap();
        let int = pool.add(Constant::Integer(3)).unwrap();
        assert_eq!((long, double, int), (ConstantIndex(1), ConstantIndex(3), ConstantIndex(5)));
        assert_eq!(pool.get(ConstantIndex(2)), None, "second half of a long");
        assert_eq!(pool.lookup(&Constant::double(1.5)), Some(double));
    }

    #[test]
    fn member_resolution() {
        let mut pool = ConstantsPool::new();
        let field = pool.add_field_ref("me/Point", "x", "I").unwrap();
        let method = pool
            .add_method_ref("java/util/List", "size", "()I", true)
            .unwrap();
        assert_eq!(
            pool.get_member(field),
            Some(MemberInfo {
                class_name: "me/Point",
                name: "x",
                descriptor: "I",
                is_interface: false,
            })
        );
        assert_eq!(pool.get_member(method).map(|m| m.is_interface), Some(true));
        assert_eq!(pool.get_member(ConstantIndex(1)), None);
    }

    #[test]
    fn overflow_is_detected() {
        let mut pool = ConstantsPool::new();
        for i in 0..(u16::MAX as i32 - 1) {
            pool.add(Constant::Integer(i)).unwrap();
        }
        assert!(matches!(
            pool.add(Constant::Integer(-1)),
            Err(ConstantPoolOverflow { offset: 65535, .. })
        ));
    }

    #[test]
    fn modified_utf8() {
        assert_eq!(encode_modified_utf8("a\x00a"), vec![97, 192, 128, 97]);
        assert_eq!(encode_modified_utf8("é"), vec![0xC3, 0xA9]);
        assert_eq!(
            encode_modified_utf8("\u{1F600}"),
            vec![0xED, 0xA0, 0xBD, 0xED, 0xB8, 0x80]
        );
    }
}
