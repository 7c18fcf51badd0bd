//! Online pulse analysis for MSO5000-class oscilloscopes.
//!
//! [`AcquisitionEngine`] queries waveform frames from the scope on a
//! background thread, integrates each pulse inside a live-tunable time window
//! above a threshold, and fills the result into an ADC sum distribution
//! while reporting the capture rate.

pub mod engine;
pub mod error;
pub mod params;
pub mod rate;
pub mod reducer;
pub mod simulator;
pub mod sink;
pub mod transport;
pub mod types;

pub use engine::{AcquisitionEngine, PULSE_SHAPE_NAME};
pub use error::{DaqError, Result};
pub use params::{CancellationToken, LiveParameters, ParameterSnapshot, SelectionCuts};
pub use rate::RateEstimator;
pub use reducer::reduce_frame;
pub use simulator::{SimulatedScope, SimulatorConfig};
pub use sink::{DistributionSink, Histogram, HistogramExport, PulseTrace, TraceExport, TraceSink};
pub use transport::{char_device_opener, CharDeviceTransport, Opener, Transport};
pub use types::*;
