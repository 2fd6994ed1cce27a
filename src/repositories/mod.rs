pub mod memory;
pub mod scan_repo;
pub mod target_repo;
pub mod vulnerability_repo;

pub use memory::{InMemoryScanJobRepository, InMemoryTargetRepository, InMemoryVulnerabilityRepository};
pub use scan_repo::ScanJobRepository;
pub use target_repo::TargetRepository;
pub use vulnerability_repo::VulnerabilityRepository;
