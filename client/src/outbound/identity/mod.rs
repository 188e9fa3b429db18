//! Identity provider adapters.

mod static_token;
mod token_file;

pub use static_token::StaticTokenProvider;
pub use token_file::TokenFileProvider;
