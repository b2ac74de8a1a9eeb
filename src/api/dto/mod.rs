//! Data Transfer Objects for REST response serialization.

pub mod destination_dto;
pub mod system_dto;

pub use destination_dto::*;
pub use system_dto::*;
