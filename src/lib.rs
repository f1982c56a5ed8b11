//! # CCD Camera Engine
//!
//! This crate is the device-protocol and frame-reconstruction core for
//! USB-attached CCD cameras speaking the Starlight Xpress vendor command
//! set. It owns the path from "issue exposure command" to "validated,
//! correctly laid-out raw pixel buffer"; display rendering, file formats,
//! and UI concerns live in the consumers of the [`controller::Exposure`]
//! values it produces.
//!
//! ## Crate Structure
//!
//! - **`transport`**: the raw byte channel to one camera — the `Transport`
//!   trait, an in-process simulated camera (`transport::sim`), and an
//!   optional serial backend behind the `transport_serial` feature.
//! - **`protocol`**: the vendor wire format — opcode table, 8-byte setup
//!   packets, typed command encoding, and the CCD parameter block.
//! - **`queue`**: `CommandQueue`, the actor that serializes command
//!   execution over one transport and accumulates partial reads.
//! - **`device`**: one connected camera — `SensorDescriptor`, supplemental
//!   operations (echo, timers, guide pulses, serial pass-through, EEPROM),
//!   and the exposure state machine.
//! - **`reconstruct`**: weave and derotation passes turning raw field
//!   buffers into display-ordered images.
//! - **`controller`**: `CameraController`, the capture orchestrator —
//!   temperature gating, the continuous-capture loop, dithering, and
//!   exposure delivery.
//! - **`cancel`**: the cooperative `CancelToken` shared by the state
//!   machines.
//! - **`registry`**: process-wide discovery registry of attached cameras.
//! - **`config`** / **`trace`**: TOML + environment configuration and
//!   tracing setup.
//! - **`error`**: the layered error taxonomy under `CameraError`.

pub mod cancel;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod reconstruct;
pub mod registry;
pub mod trace;
pub mod transport;

pub use cancel::CancelToken;
pub use controller::{CameraController, CaptureSettings, CaptureState, CaptureSummary, Exposure};
pub use device::{
    CcdDevice, ExposeCommandKind, ExposureRegion, ExposureState, ExposureTiming, SensorDescriptor,
    TimingMode,
};
pub use error::{CamResult, CameraError, DeviceError, ProtocolError, ReconstructError, TransportError};
pub use reconstruct::{FieldOrder, FrameGeometry, ReconstructedImage};
