pub mod channel;
pub mod gateway;
pub mod memory;
pub mod realtime;
pub mod rest;

pub use channel::*;
pub use gateway::*;
pub use memory::*;
pub use realtime::*;
pub use rest::*;
