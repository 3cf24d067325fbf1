pub mod manager;

pub use manager::{php_fpm_unit, ServiceError, ServiceManager};
