//! Synchronization primitives for in-process communication.
//!
//! The dispatcher needs exactly one: a blocking FIFO that carries outbound
//! messages from caller threads to the worker thread.

pub mod queue;
