pub mod account;
pub mod errors;
pub mod plan;
pub mod regime;
pub mod repositories;
pub mod signals;
pub mod tripwire;
pub mod ports;
