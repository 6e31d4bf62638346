//! Job setup for a synthetic I/O load generator.

pub mod arena;
pub mod debug;
pub mod engine;
pub mod error;
pub mod filehash;
pub mod fixup;
pub mod options;
pub mod parser;
pub mod random;
pub mod rate;
pub mod record;
pub mod setup;

pub use error::SetupError;
pub use parser::{add_job_opts, parse_job_file, JobSource, ParseOptions, ParseReport, SectionFilter};
pub use setup::{JobRef, JobTable, SetupConfig};
