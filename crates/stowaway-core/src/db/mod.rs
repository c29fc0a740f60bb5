//! Database layer for Stowaway

mod connection;
mod download_repository;
mod key_value_repository;
mod migrations;
mod operation_repository;
mod values;

pub use connection::Database;
pub use download_repository::{DownloadRepository, LibSqlDownloadRepository};
pub use key_value_repository::{KeyValueRepository, LibSqlKeyValueRepository};
pub use migrations::CURRENT_VERSION;
pub use operation_repository::{LibSqlOperationRepository, OperationRepository};
