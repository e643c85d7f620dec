pub mod apply;
pub mod chunk;
pub mod deps;
mod encoding;
pub mod erasure;
pub mod error;
pub mod file;
pub mod merkle;
pub mod metadata;
pub mod pubkey;
pub mod recovery;
pub mod update;
pub mod wal;

pub use deps::{Dependencies, FaultyDisk, ProductionDependencies};
pub use error::{Error, Result};
pub use file::{FileConfig, FileMetrics, PieceFile};
pub use metadata::{ErasureConfig, Metadata};
pub use pubkey::{HostPublicKey, PublicKeyTable, Specifier};
pub use recovery::{LoadState, Loader};
pub use wal::{Transaction, Update, Wal};
