pub mod inscriber;
pub mod metrics;
pub mod signer;
pub mod tracker;
pub mod traits;
pub mod types;
pub mod utils;

pub use inscriber::{Inscriber, InscriptionRequest};
