pub mod engine;
pub mod outputs;
pub mod resolve;
pub mod retry;
