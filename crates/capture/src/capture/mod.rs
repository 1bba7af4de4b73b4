//! Frame capture: pool, assembler and session
//!
//! - [`pool`]: preallocated frame slots handed out as leases, and the output queue
//! - [`assembler`]: turns protocol packets into frames according to the scan policy
//! - [`session`]: programs the device and owns the streaming pipeline

pub mod assembler;
pub mod pool;
pub mod session;

pub use assembler::FrameAssembler;
pub use pool::{CapturedFrame, FrameLease, FramePool, MIN_POOL_SIZE, OutputQueue, output_queue};
pub use session::{
    CaptureSession, FrameConsumer, SessionError, SessionParams, SessionState, StopSummary,
};
