//! Integration test suite modules
//!
//! Scenarios run against scripted serial ports and an in-process broker
//! channel, so no hardware or network is needed.

mod decoder_resync_test;
mod end_to_end_test;
mod processor_warmup_test;
mod publisher_outage_test;
mod reconnect_test;
mod storage_rotation_test;
mod support;
