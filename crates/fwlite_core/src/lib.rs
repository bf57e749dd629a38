//! Listener fan-out and per-connection workers.
//!
//! The master binds one listener per profile digit (`base_port + i`, each
//! carrying its policy level) and spawns a worker task per accepted
//! connection. Workers run the serial HTTP/1.1 request loop and dispatch
//! into the proxy engines; self-addressed requests land on the admin API.

pub mod master;
pub mod worker;

pub use master::Master;
