//! HIL Simulation Library
//!
//! This crate provides a simulated device under test for exercising channels
//! and dispatch engines without physical hardware. It includes:
//!
//! - **SimulatedTarget**: a [`Transport`](hil_channel::Transport) standing in
//!   for a physical medium
//! - **TargetHandle**: the test-side remote control of that target
//! - **TargetLog**: the target's log output, for
//!   [`LogCapture`](hil_channel::LogCapture)
//!
//! # Example
//!
//! ```rust
//! use hil_channel::{Channel, Frame};
//! use hil_sim::SimulatedTarget;
//!
//! # async fn example() -> Result<(), hil_channel::ChannelError> {
//! let (target, handle) = SimulatedTarget::new("dut");
//! let channel = Channel::new("uart", target);
//!
//! channel.open().await?;
//! handle.inject(Frame::new(vec![0x01], Some(0x10)));
//! channel.send(&[0x02], None).await?;
//! assert_eq!(handle.sent().len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod target;

pub use target::{Hook, SimulatedTarget, TargetHandle, TargetLog};
