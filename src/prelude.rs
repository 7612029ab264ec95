pub use crate::client::{HttpRequest, HttpResponse, Transport, TransportError};
pub use crate::config::{SkeinConfiguration, SkeinDefault, SkeinDefaultType};
pub use crate::executor::{ExecutorConfig, ExecutorKind, ScenarioOutcome};
pub use crate::metrics::{MetricsSnapshot, Sample};
pub use crate::report::RunResult;
pub use crate::scenario::{Scenario, Workload, WorkloadFunction};
pub use crate::scheduler::{CancelHandle, LifecycleEvent};
pub use crate::select::{ActionSelector, SelectionPolicy};
pub use crate::timeline::Stage;
pub use crate::user::{VirtualUser, WorkloadError, WorkloadResult};
pub use crate::{workload, LoadTest, SkeinError};
