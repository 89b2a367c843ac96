//! # Kernel Initialization Module
//!
//! - `init`: ordered bring-up of the boot core
//! - `status`: per-phase status, reported once bring-up finishes
//!
//! ```ignore
//! use crate::core::kernel::{register_component, update_component_status, InitStatus};
//!
//! register_component("Physical Memory");
//! // ... build the page bitmap ...
//! update_component_status("Physical Memory", InitStatus::Completed);
//! ```

pub mod init;
pub mod status;

pub use init::init_kernel;
pub use status::{register_component, update_component_status, InitStatus};
