pub mod blocking;
pub mod credentials;
pub mod object_store;
pub mod queue;
pub mod sdk_errors;
pub mod version_store;
