pub mod costs;
pub mod heartbeats;
