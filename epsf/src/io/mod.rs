//! File I/O for engine interchange and pipeline outputs.

pub mod fits;

pub use fits::{read_image_fits, write_image_fits};
