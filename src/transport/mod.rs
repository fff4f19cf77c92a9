//! Transport backends implementing [crate::channel::DoipChannel]
//!
//! ### Blocking backend
//! [blocking::BlockingTcpChannel] owns a TCP socket and polls it from the calling thread.
//!
//! ### Event backend
//! [event::EventChannel] sits on top of a [event::NetworkStack] that reports
//! connect, send and receive completion through callbacks. A std thread based
//! stack is provided as [event::ThreadedTcpStack]; embedded targets can plug in
//! their own stack by implementing [event::NetworkStack].

pub mod blocking;
pub mod event;
pub mod simulation;
