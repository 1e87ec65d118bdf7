pub mod methods;
pub mod processors;
pub mod queue;
pub mod rate_limit;
pub mod storage;
pub mod submission;
pub mod watchdog;
pub mod worker;
