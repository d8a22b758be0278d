//! Integration test harness for the acquisition pipeline
//!
//! This suite validates:
//! - Frame resynchronisation over noisy byte streams
//! - Rotating storage and the batch extract/acknowledge contract
//! - Publishing across broker outages
//! - Sensor loss, reconnection and bounded recovery
//! - End-to-end flow from serial bytes to stored rows and broker messages

mod integration;
