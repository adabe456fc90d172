//! Document processors: decomposition, extraction, reassembly

pub mod decomposer;
pub mod extract;
pub mod reassembler;
