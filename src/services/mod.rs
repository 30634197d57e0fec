pub mod gateway;
pub mod job_status;
pub mod processor;
pub mod queue;
pub mod store;
