// bulkretry: retry coordination for partially failed bulk write batches
// Exposes the coordinator, its collaborators and a simulated cluster as a library

pub mod backoff;
pub mod bulk;
pub mod cli;
pub mod context;
pub mod error;
pub mod executor;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod simulate;
pub mod validation;
