pub mod args;
pub mod config;
pub mod degradation;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod model;
pub mod requester;
pub mod stream;
pub mod tester;
