//! Class file structures that a method body produces or consumes
//!
//! Only the pieces which the `Code` attribute needs are modelled: the constant pool (which
//! instructions index into), and the tables/attributes derived from a method body.

mod attribute;
mod constants;
mod serialize;

pub use attribute::*;
pub use constants::*;
pub use serialize::*;
