extern crate fs2;

pub mod fs;
