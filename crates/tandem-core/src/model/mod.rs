//! Document data model
//!
//! - `operation`: atomic invertible edits addressed by path
//! - `change`: ordered batches of operations plus selections
//! - `selection`: text selections carried inside changes
//! - `document`: the node graph operations are applied to

pub mod change;
pub mod document;
pub mod operation;
pub mod selection;

pub use change::{Change, ChangeInfo, ChangeState};
pub use document::Document;
pub use operation::{path, Diff, Operation, Path};
pub use selection::Selection;
