pub mod config;
pub mod dag;
pub mod error;
pub mod executor;
pub mod output;
pub mod planner;
pub mod provider;
pub mod state;
