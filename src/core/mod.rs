#![forbid(unsafe_code)]

pub mod hash;
pub mod layout;
pub mod time;
pub mod tree;
