//! Build and edit JVM method bodies
//!
//! ### Simple example
//!
//! Consider the following Java method:
//!
//! ```java,ignore,no_run
//! static int abs(int x) {
//!     if (x < 0) {
//!         return -x;
//!     }
//!     return x;
//! }
//! ```
//!
//! An analogous method body can be built, laid out, and annotated with stack map frames as
//! follows:
//!
//! ```
//! use jvm_insnlist::jvm::class_file::ConstantsPool;
//! use jvm_insnlist::jvm::class_graph::ClassTree;
//! use jvm_insnlist::jvm::code::*;
//! use jvm_insnlist::jvm::*;
//!
//! # fn generate_code() -> Result<(), Error> {
//! let mut list = InstructionList::new();
//! list.append(Instruction::ILoad(0))?;
//! let positive = list.append(Instruction::ILoad(0))?;
//! list.append(BranchInstruction::IReturn)?;
//! list.insert_before(positive, BranchInstruction::If(OrdComparison::GE, positive))?;
//! list.insert_before(positive, Instruction::ILoad(0))?;
//! list.insert_before(positive, Instruction::INeg)?;
//! list.insert_before(positive, BranchInstruction::IReturn)?;
//!
//! let method = MethodContext::new(
//!     "me/alec/Math",
//!     "abs",
//!     MethodDescriptor::parse("(I)I")?,
//!     MethodAccessFlags::STATIC,
//! );
//! let mut constants = ConstantsPool::new();
//! let mut code = MethodCode::new(list);
//! let generated = code.generate(&method, &mut constants, &ClassTree::new())?;
//! assert_eq!(generated.code.len(), 9);
//! assert_eq!(generated.max_stack, 1);
//! assert_eq!(generated.max_locals, 1);
//! assert_eq!(generated.stack_map.0.len(), 2);
//! # Ok(())
//! # }
//! # generate_code().unwrap();
//! ```

mod access_flags;
pub mod class_file;
pub mod class_graph;
pub mod code;
mod descriptors;
mod errors;
mod method;
pub mod verifier;

pub use access_flags::*;
pub use descriptors::*;
pub use errors::*;
pub use method::*;
