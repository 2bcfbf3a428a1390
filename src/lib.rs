//! Host-side driver and operations manager for HiDock H1/H1E/P1 USB voice
//! recorders: a synchronous Jensen-protocol transport and session, a
//! command layer, a file-list/metadata cache, and a background operations
//! queue for batched downloads and deletes.

pub mod cache;
pub mod commands;
pub mod constants;
pub mod device;
pub mod error;
pub mod file_list;
pub mod frame;
pub mod operations;
pub mod receiver;
pub mod session;
pub mod transport;

pub use device::{Device, DeviceCapability, DeviceModel, discover};
pub use error::{HiDockError, Result};
pub use operations::{Operation, OperationKind, OperationStatus, OperationsManager};
pub use session::JensenSession;
