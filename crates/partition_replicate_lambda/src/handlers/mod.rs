pub mod ingest;
pub mod worker;
