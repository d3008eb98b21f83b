//! Types handed across the library boundary to the host.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them as JSON unchanged.

pub mod events;
