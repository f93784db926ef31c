#![doc = include_str!("../README.md")]

pub mod blur;
pub mod postprocess;
pub mod preprocess;

pub use blur::BlurConfig;
pub use postprocess::{Postprocessor, RefineConfig};
pub use preprocess::{IMAGENET_MEAN, IMAGENET_STD, Preprocessed, Preprocessor};
