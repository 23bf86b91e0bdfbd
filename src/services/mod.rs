//! Built-in RPC handlers served by the binary.

pub mod echo;

pub use echo::EchoService;
