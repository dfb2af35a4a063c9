pub mod apdu;
pub mod backend;
pub mod config;
pub mod sequencer;
pub mod session;
pub mod transmitter;
pub mod utils;
