//! # lumos-viewer: LiDAR scan viewer
//!
//! Connects to a range-and-angle sensor over TCP, UDP or a serial line
//! through `lumos-core`, decodes the sample stream, and keeps the latest
//! revolution as projected points ready to draw.

pub mod cloud;
pub mod codec;
pub mod config;
pub mod controller;

pub use cloud::PointCloud;
pub use codec::{Sample, SampleCodec};
pub use config::ViewerConfig;
pub use controller::{Controller, ScanView};
