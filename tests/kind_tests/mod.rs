//! Integration tests for vm-controller
//!
//! Tests are organized by the story they tell:
//!
//! - `provisioning`: a user VM is created from the bundled templates and
//!   failed runs leave nothing behind
//! - `lifecycle`: a provisioned VM is stopped, started and deleted through
//!   the worker pool while the store tracks its status

mod helpers;
mod lifecycle;
mod provisioning;
