pub mod cli;
pub mod clock;
pub mod errors;
pub mod events;
pub mod models;
pub mod poller;
pub mod storage;
pub mod tracker;
