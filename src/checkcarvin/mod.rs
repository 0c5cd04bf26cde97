//! Secondary report provider (checkcar.vin): a quota-limited account pool and
//! a driver issuing calls through challenge-cleared sessions.

pub mod accounts;
pub mod config;
pub mod driver;
pub mod session;

pub use accounts::{AccountPool, PoolError, RefreshSummary, Reservation};
pub use config::CheckCarVinConfig;
pub use driver::{AuthPair, Driver, DriverError, PaymentResult, VinSummary};
pub use session::{SessionFactory, session_factory};
