//! RCC Core - shared library for the device-side Realtime Communication Core.
//!
//! This crate provides the core functionality for an assistive wearable's
//! on-device runtime: WebRTC calling, broker-based signaling, voice activity
//! detection, camera/audio capture, and telemetry/obstacle-alert publishing.
//! It has no inbound HTTP/WS surface of its own (see `DESIGN.md`); it is
//! driven entirely by the broker and embedded by the `rcc-device` binary.
//!
//! # Architecture
//!
//! The crate is organized by component, one module per letter in the
//! C1-C11 component map:
//!
//! - [`registry`]: Device handle registry (C1)
//! - [`audio_io`], [`cpal_audio`]: Audio capture/playback (C2)
//! - [`camera`], [`nokhwa_camera`]: Camera capture (C3)
//! - [`vap`]: Voice activity pipeline (C4)
//! - [`broker`]: Broker session (C5)
//! - [`signaling`]: Signaling router (C6)
//! - [`webrtc_peer`]: WebRTC peer (C7)
//! - [`call_coordinator`]: Call coordinator (C8)
//! - [`reassembly`]: Audio reassembly (C9)
//! - [`telemetry`]: GPS/segmentation publishers (C10)
//! - [`alarms`]: Sensor (ToF) alarms (C11)
//!
//! Supporting modules: [`config`], [`error`], [`events`], [`runtime`],
//! [`utils`], [`wire`], [`assets`], and [`bootstrap`] (the composition root).
//!
//! # Abstraction Traits
//!
//! Hardware and collaborators are reached through traits so components stay
//! testable without real devices:
//!
//! - [`TaskSpawner`](runtime::TaskSpawner): spawning background loops
//! - [`EventEmitter`](events::EventEmitter): emitting domain events
//! - [`AudioEngine`](audio_io::AudioEngine): microphone/speaker I/O
//! - [`CameraDevice`](camera::CameraDevice): camera capture
//! - [`TofSensor`](alarms::TofSensor): distance sensor reads
//! - [`AssetLibrary`](audio_io::AssetLibrary): named warning-asset playback
//! - [`BrokerClient`](broker::BrokerClient): pub/sub session

#![warn(clippy::all)]

pub mod alarms;
pub mod assets;
pub mod audio_io;
pub mod bootstrap;
pub mod broker;
pub mod call_coordinator;
pub mod camera;
pub mod config;
pub mod cpal_audio;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod nokhwa_camera;
pub mod reassembly;
pub mod registry;
pub mod runtime;
pub mod signaling;
pub mod telemetry;
pub mod utils;
pub mod vap;
pub mod webrtc_peer;
pub mod wire;

// Re-export commonly used types at the crate root
pub use bootstrap::{bootstrap_services, BootstrappedServices, HardwareDeps};
pub use config::Config;
pub use error::{ErrorCode, RccError, RccResult};
pub use events::{BroadcastEventBridge, EventEmitter, RccEvent};
pub use lifecycle::{Lifecycle, NoopLifecycle, ProcessLifecycle};
pub use registry::DeviceRegistry;
pub use runtime::{TaskSpawner, TokioSpawner};
pub use utils::now_millis;
