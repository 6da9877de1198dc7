//! Runtime: the dispatch worker and the handle that owns it.
//!
//! - `dispatcher`: [`Dispatcher`](dispatcher::Dispatcher) handle, worker
//!   loop, frame classification, identity filters and callbacks.

pub mod dispatcher;
