//! Storage module
//!
//! Piece bookkeeping and verification, plus the backends verified pieces
//! are written to.

pub mod backend;
pub mod file;
pub mod manager;
pub mod memory;
pub mod piece;

// Re-export backend types
pub use backend::StorageBackend;

// Re-export piece types
pub use piece::{Block, BlockRequest, BlockStatus, Piece, PieceStatus, BLOCK_SIZE};

pub use manager::{BlockOutcome, PieceManager, PieceManagerConfig, VerifiedPiece};

pub use file::{FileEntry, FileStorage};
pub use memory::MemoryStorage;
