pub mod config;
pub mod connection;
pub mod db;
pub mod equivalence;
pub mod error;
pub mod events;
pub mod interpreter;
pub mod merge;
pub mod model;
pub mod reload;
pub mod retention;
pub mod store;
