mod bson;
mod collection;
pub mod errors;

pub use bson::Id;
pub use collection::{ensure_indexes_exist, index_names, Coll, MongoCollection};
