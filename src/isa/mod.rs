//! C1 — Encoder/Decoder. Pure functions mapping instruction bytes to
//! mnemonic + fields and back (§4.1).

pub mod decode;
pub mod encode;
pub mod fields;

pub use decode::decode;
pub use fields::{BranchCond, DecodedInsn, Fields, Mnemonic, Reg, A0, A1, A2, RA, SP, T6, X0};
