#[macro_use] extern crate anyhow;
#[macro_use] extern crate derive_more;
#[macro_use] extern crate enum_as_inner;
#[macro_use] extern crate lazy_static;

pub mod base32;
pub mod hash;
pub mod logger;
pub mod nar;
mod prelude;
pub mod store;
pub mod util;

pub use hash::{Encoding, Hash, HashType};
pub use prelude::*;
pub use store::{Store, StorePath, StorePathSet};
