//! Transport implementations

pub mod loopback;

pub use loopback::{Congestion, LoopbackConfig, LoopbackListener, LoopbackNetwork, LoopbackTransport};
