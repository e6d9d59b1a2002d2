pub mod config;
pub mod serve;
pub mod sign_url;
