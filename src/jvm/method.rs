use crate::jvm::{MethodAccessFlags, MethodDescriptor, RefType};

/// Name of instance initialization methods
pub const INIT_NAME: &str = "<init>";

/// The method whose body is being analyzed
///
/// This is what seeds the entry frame: the receiver (if any) goes in local 0 and the parameters
/// follow, with `long` and `double` parameters taking two slots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodContext {
    /// Internal binary name of the declaring class (eg. `java/lang/String`)
    pub class_name: String,

    pub name: String,
    pub descriptor: MethodDescriptor,
    pub access_flags: MethodAccessFlags,
}

impl MethodContext {
    pub fn new(
        class_name: impl Into<String>,
        name: impl Into<String>,
        descriptor: MethodDescriptor,
        access_flags: MethodAccessFlags,
    ) -> MethodContext {
        MethodContext {
            class_name: class_name.into(),
            name: name.into(),
            descriptor,
            access_flags,
        }
    }

    pub fn is_static(&self) -> bool {
        self.access_flags.contains(MethodAccessFlags::STATIC)
    }

    /// Constructors receive an uninitialized `this`
    pub fn is_constructor(&self) -> bool {
        self.name == INIT_NAME && !self.is_static()
    }

    pub fn this_type(&self) -> RefType {
        RefType::Object(self.class_name.clone())
    }
}
