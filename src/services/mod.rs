pub mod admission_queue;
pub mod broadcaster;
pub mod ingestion;
pub mod scan_manager;
pub mod scanners;

pub use admission_queue::{Admission, AdmissionQueue};
pub use broadcaster::{ProgressBroadcaster, ScanEvent, Subscription};
pub use ingestion::{IngestionPipeline, IngestionSummary};
pub use scan_manager::{RecoveryReport, ScanManager};
pub use scanners::{AdapterContext, AdapterEvent, AdapterRegistry, ScannerAdapter};
