pub mod backup;
pub mod players;
pub mod server;
pub mod system;
