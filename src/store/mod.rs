mod entry;
mod table;

pub use entry::{Entry, EntryHandle};
pub use table::{lookup_hash, HashTable};
