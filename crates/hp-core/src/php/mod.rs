//! PHP-FPM pools and the PHP versions behind them.

pub mod limits;
pub mod manager;
pub mod packages;
pub mod parser;
pub mod pool;

pub use limits::{IniOverrides, PhpLimits};
pub use manager::{PhpFpmManager, PoolError};
pub use pool::PoolConfig;
