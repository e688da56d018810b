//! SLURM integration: batch scripts, output parsing and the executor.

mod adapter;
pub mod parser;
pub mod templates;

pub use adapter::{JobExecutor, SlurmConfig, SlurmExecutor, SlurmJobInfo, SlurmState};
