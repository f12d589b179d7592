// Analysis execution: one job in, one stored analysis out

pub mod executor;
pub mod parse;

pub use executor::{AnalysisExecutor, ExecutionOutcome, ExecutorConfig, ExecutorError};
pub use parse::{degraded_record, parse_reply, ParseError};
