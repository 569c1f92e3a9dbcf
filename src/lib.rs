pub mod backup;
pub mod config;
pub mod ipc;
pub mod players;
pub mod supervisor;
pub mod system;
