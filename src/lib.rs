pub mod config;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod info;
pub mod output;
pub mod pipeline;
pub mod pool;
pub mod providers;
pub mod store;
pub mod toolkit;
pub mod transfer;
pub mod validator;
