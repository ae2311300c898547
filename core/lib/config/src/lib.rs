pub use crate::configs::InscriberConfig;

pub mod configs;
