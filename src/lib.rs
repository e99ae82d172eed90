pub mod arena;
pub mod config;
pub mod conn;
pub mod directory;
pub mod pairing;
pub mod protocol;
pub mod search;
pub mod server;
pub mod state;
