//! Services shared by the sync engine and client surfaces.

mod local_store;

pub use local_store::LocalStore;
