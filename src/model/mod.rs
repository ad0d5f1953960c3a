//! Core data model.
//!
//! Work items are created by the API layer and routed, executed, and
//! annotated here. Workers carry capacity accounting. Routing rules and
//! delivery targets are configuration-as-data, parsed into closed enums
//! so evaluation stays exhaustive and testable.

pub mod delivery;
pub mod routing;
pub mod work;
pub mod worker;

pub use delivery::*;
pub use routing::*;
pub use work::*;
pub use worker::*;
