pub mod sqlite;

pub use sqlite::{prepare_data_dir, StoreHandle};
