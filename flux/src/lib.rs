#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod logging;
pub mod shared;
pub mod time;
pub mod util;
