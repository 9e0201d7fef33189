mod engine_db;
mod schema;

pub(crate) use engine_db::from_millis;
pub use engine_db::EngineDb;
pub use schema::ENGINE_VERSIONED_SCHEMAS;
