//! The four polling workers.
//!
//! | worker      | source                          | default interval | batch |
//! |-------------|---------------------------------|------------------|-------|
//! | `delivery`  | upstream events after cursor    | 5s               | 5     |
//! | `scheduler` | due scheduled deliveries        | 60s              | 10    |
//! | `jobs`      | due scheduled routes            | 60s              | all   |
//! | `dlq`       | due dead-letter entries         | 60s              | 50    |

mod delivery;
mod dlq;
mod jobs;
mod scheduler;

pub use delivery::{EventDeliveryConfig, EventDeliveryWorker, DELIVERY_WORKER};
pub use dlq::{DlqWorker, DlqWorkerConfig, DLQ_WORKER};
pub use jobs::{JobWorker, JOB_WORKER};
pub use scheduler::{SchedulerWorker, SCHEDULER_WORKER};
