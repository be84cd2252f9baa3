pub mod admission;
pub mod manager;
pub mod reaper;

pub use admission::{AdmissionController, AdmissionSettings, RunLimitDecision};
pub use manager::{RunManager, StartRun};
pub use reaper::{ReaperSettings, StaleRunReaper, spawn_reaper};
