//! Stack map frame inference
//!
//! For any specific instruction inside a method body, the stack and locals should have the same
//! structure, regardless of which control flow was used to reach that instruction. In other words:
//! although the values on the stack and in the locals may obviously be different, the types and
//! order of the stack and local variables cannot. This information is referred to as the _stack
//! map frame_ (represented using [`Frame`]) and the set of stack map frames for all the block
//! boundaries in a method is the _stack map table_.
//!
//! Knowing the frame at a point in the code makes it possible to compute the frame after the next
//! instruction (eg. `dadd` only makes sense if the top two elements on the stack are of type
//! `double`, and it leaves one `double` in their place). The "types" used (represented using
//! [`VerificationType`]) are slightly augmented to take into account initialization and null.
//!
//! Straight-line code is simple (see [`Frame::interpret_instruction`]). Things get more
//! complicated when an instruction can be reached from multiple locations (eg. it is the target of
//! jumps). In those cases, the frames from the different source locations are joined, and the
//! blocks downstream of a changed frame are processed again until nothing changes anymore (see
//! [`infer_frames`]). The result is then written out as a
//! [`crate::jvm::class_file::StackMapTable`] attribute by [`stack_map_table`].
//!
//! [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.10.1

mod dataflow;
mod frame;
mod stack_map;
mod types;

pub use dataflow::*;
pub use frame::*;
pub use stack_map::*;
pub use types::*;
