pub mod checkpoint;
pub mod metadata;
pub mod mysql_stream;
pub mod pg_stream;
pub mod running;
pub mod table_meta_cache;
