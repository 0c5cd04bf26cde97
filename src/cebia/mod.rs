//! Primary report provider (Cebia AutoTracer): token-authenticated queue API.

pub mod client;
pub mod config;

pub use client::{CebiaApi, CebiaClient, CebiaError, VehicleInfo};
