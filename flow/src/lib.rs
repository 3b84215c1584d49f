pub mod axes;
pub mod cancel;
pub mod cascade;
pub mod desc;
pub mod error;
pub mod exec;
pub mod filter;
pub mod kernels;
pub mod roi;
pub mod source;
pub mod store;
pub mod writer;

pub use error::{EngineError, Result};
