//! The bulk control-plane task processor's internals: the controller that supervises
//! a small pool of task workers, and the worker loop itself.

mod controller;
mod worker;

pub use controller::EventController;
