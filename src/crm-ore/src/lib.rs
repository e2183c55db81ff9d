//! Small utilities shared by every `crm-*` crate: an extension of the
//! standard library, not a framework.

pub mod retry;
pub mod task;
