mod logging;
pub mod poller;
pub mod trace_event;
pub mod trace_store;

pub use logging::{init_logging, LoggingConfig, TelemetryError};
pub use poller::{PollerConfig, PollerHandle, PollerState, TracePoller};
pub use trace_event::{RecordKind, TraceEvent};
pub use trace_store::{LogAnalyticsStore, QueryTable, TraceQuery, TraceStore, TraceStoreError};
