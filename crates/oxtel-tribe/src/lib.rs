pub mod agreement;
pub mod error;
pub mod member;
pub mod msg;
pub mod tribe;

pub use error::{Result, TribeError};
pub use tribe::{Tribe, TribeConfig};
