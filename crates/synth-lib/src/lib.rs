//! Trace-driven workload event synthesis
//!
//! This crate turns raw per-resource utilization traces (CPU, GPU, memory)
//! into a chronologically ordered stream of workload lifecycle events for a
//! cluster-scheduling simulator:
//!
//! - Per-resource debounced state machines
//! - Trace drivers with gap detection and garbage collection
//! - An n-way event-merging synthesizer
//! - Per-session lifecycle aggregation
//! - A template-based sequencer that bypasses trace files entirely

pub mod driver;
pub mod error;
pub mod events;
pub mod models;
pub mod resource;
pub mod sequencer;
pub mod session;
pub mod synthesizer;

pub use driver::{
    load_pod_map, parse_downtimes, DriverConfig, ExecutionMode, Reading, SessionMaxTracker,
    TraceDriver,
};
pub use error::SynthesisError;
pub use events::{
    ChannelConsumer, Event, EventConsumer, EventName, EventPayload, ResourceEventKind,
    ResourceKind, SessionEventKind, SourceMessage,
};
pub use models::{MaxUtilizationProvider, SessionTemplate, TrainingTemplate};
pub use resource::{DebounceConfig, StateMachine, UtilState, UtilStatus};
pub use sequencer::TemplateEventSequencer;
pub use session::{ReadinessConfig, SessionSnapshot, SessionStatus};
pub use synthesizer::Synthesizer;
