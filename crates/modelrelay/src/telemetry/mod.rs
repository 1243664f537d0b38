pub mod log;
pub mod trace;

pub use log::AsyncLog;
pub use trace::TraceStore;
