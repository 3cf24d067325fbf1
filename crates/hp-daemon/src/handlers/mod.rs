pub mod accounts;
pub mod domains;
pub mod install;
pub mod mail;
pub mod ssl;
