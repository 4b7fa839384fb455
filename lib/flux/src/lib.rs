#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod logging;
pub mod time;
pub mod token;

pub use token::{SessionToken, TOKEN_PREFIX_SIZE, TOKEN_SIZE};
