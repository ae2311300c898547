pub use self::inscriber::InscriberConfig;

pub mod inscriber;
