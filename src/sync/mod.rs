pub mod agent;

pub use agent::{SyncAgent, SyncReport};
