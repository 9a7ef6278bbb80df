//! Script program parsing, verification (§4.8), and lowering into the flat action/
//! payload lists a `Shard` runs (§6.1/§6.2).

pub mod program;
pub mod verifier;

pub use program::{LoweredProgram, Program};
