//! Process-wide event bus
//!
//! Carries `PersistState`, `Migrating`, `Aborting` and `SystemInfo` signals
//! between the embedding process and the engine components. Persistence
//! cadence is driven from here: the periodic ticker and the final
//! shutdown-time persist both arrive as `PersistState` events.

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventBusError};
pub use types::{SystemEvent, SystemLoad};
