mod client;
mod coordinator;
mod diff;
mod error;
mod lenient;
mod logger;
mod protocol;
mod types;

pub use client::{
    VestaClient, VestaClientBuilder, DEFAULT_EVENT_LOG_LIMIT, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_BASE_DELAY, DEFAULT_TIMEOUT,
};
pub use coordinator::{
    Coordinator, CoordinatorBuilder, SetupError, UpdateFailed, UpdateStatus,
    DEFAULT_UPDATE_INTERVAL,
};
pub use error::{Error, ErrorKind, Result};
pub use logger::MessageLogMode;
pub use protocol::{
    EventLogEndpoint, ENDPOINT_DEVICE_LIST, ENDPOINT_PANEL_SET, ENDPOINT_PANEL_STATUS,
};
pub use types::*;
