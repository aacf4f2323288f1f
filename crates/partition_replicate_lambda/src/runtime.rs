pub use partition_replicate_core::{contract, error, filter, ordering, version};
