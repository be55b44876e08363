pub mod config;
pub mod error;
pub mod flock;
pub mod hasher;
pub mod index;
mod pipeline;
pub mod ring;
pub mod store;
pub mod stream;
pub mod token;

pub use config::Config;
pub use error::{Error, Result};
pub use index::{StreamInfo, StreamMetadata};
pub use store::Store;
pub use stream::{EntryReader, SizedRead, SliceReader};
pub use token::CancelToken;
