//
// runners/mod.rs
//
// Scheduling layers stacked on top of the process runner.
//

pub mod concurrency_gate;
pub mod keyed_cancelling;
pub mod keyed_serializing;
pub mod tick_scheduler;

pub use concurrency_gate::ConcurrencyGate;
pub use keyed_cancelling::KeyedCancellingRunner;
pub use keyed_serializing::KeyedSerializingRunner;
pub use tick_scheduler::TickDroppingScheduler;
