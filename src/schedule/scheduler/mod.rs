mod worker;

pub use worker::{TaskWorker, WriteRetry};
