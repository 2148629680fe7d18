//! Background tasks living alongside a gateway connection.
//!
//! Each task takes the connection context and returns once it is done. They
//! are started through [`crate::task::start_task`] by the server.

pub mod drift;
pub(crate) mod location;
pub(crate) mod stats;
pub mod version_info;

pub use drift::require_disconnect;
pub use version_info::version_info;
