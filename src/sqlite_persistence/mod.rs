mod versioned_schema;

pub use versioned_schema::{
    open_versioned, open_versioned_in_memory, Column, SqlType, Table, VersionedSchema,
    BASE_DB_VERSION,
};
