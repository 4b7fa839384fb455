//! Process bootstrap layer for the networking core (spec §6, SPEC_FULL §4.10): environment-
//! driven config, the shared token→`Session` directory, and the wiring that turns `corenet`'s
//! pieces into one running process. `game/server`'s `main` is the only caller.
pub mod bootstrap;
pub mod config;
pub mod directory;

pub use bootstrap::Bootstrap;
pub use config::{ConfigError, RuntimeConfig};
pub use directory::TokenDirectory;
