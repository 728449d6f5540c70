pub mod agent;
pub mod hooks;
pub mod supervisor;

pub use supervisor::{spawn, PtyEvent, PtySession, PtySpawnConfig};
