pub mod allocator;
pub mod config;
pub mod controller;
pub mod error;
pub mod latch;
pub mod session;
pub mod transport;

pub use allocator::{ClockIdSource, IdAllocator, IdSource};
pub use config::SyncConfig;
pub use controller::{Edit, SyncController, SyncParams};
pub use error::{AllocatorError, EngineError, LatchError, TransportError};
pub use latch::{Latch, LatchState};
pub use session::{Drainable, Session, UserInfo};
pub use transport::{NullStatus, StatusSink, SyncStatus, Transport};
