pub mod config;
pub mod coupon;
pub mod csv;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod model;
pub mod points;
pub mod quota;
pub mod rate_limit;
pub mod store;

pub use config::Config;
pub use engine::{Engine, Outcome};
pub use error::{CouponError, EngineError, LedgerError, ThrottleError};
pub use model::{ClientFingerprint, CounterpartyId, Request, Transaction, TransactionKind, UserId};
pub use points::Points;
