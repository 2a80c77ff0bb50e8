//! Wire layer: fragment codec and per-peer reassembly
//!
//! Upper-stack packets are split into MTU-sized fragments with a fixed
//! 5-byte header, carried over a reliable in-order GATT link, and rejoined
//! on the receiving side under timeout and memory bounds.

pub mod fragment;
pub mod reassembly;

pub use fragment::{Fragment, FragmentError, Fragmenter, FRAGMENT_HEADER_SIZE, MIN_MTU};
pub use reassembly::{Reassembly, ReassemblyStats, ReassemblyStore};
