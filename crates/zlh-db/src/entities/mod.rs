pub mod archived_instances;
pub mod identifier_counters;
pub mod instances;
pub mod port_pool;
pub mod publish_jobs;
pub mod templates;
