pub mod clock;
pub mod config;
pub mod devices;
pub mod engine;
pub mod error;
pub mod homewizard;
pub mod memory;
pub mod routes;
pub mod rule;
pub mod safety;
pub mod scheduler;
pub mod socket_state;
pub mod totals;
pub mod types;

pub use clock::{Clock, DayMask, DayOfWeek, TimeOfDay, WallClock};
pub use config::{AutomationConfig, DeviceConfig, NetworkConfig, RuntimeConfig};
pub use devices::{Devices, LightSensor, PowerMeter, PresenceProbe, SocketDevice};
pub use engine::{AutomationEngine, EngineAction};
pub use error::{AutomationError, DeviceError};
pub use homewizard::{CachedPresence, HomeWizardMeter, HomeWizardSocket, HttpTransport, Pinger};
pub use routes::*;
pub use rule::{Rule, SocketRules};
pub use scheduler::{Cadence, Scheduler, Stage};
pub use socket_state::{SocketId, SocketRuntimeState, MAX_SOCKETS};
pub use totals::{DailyTotals, DailyTotalsTracker};
pub use types::{NodeStatus, SocketStatus, SwitchRequest, SwitchResponse};
