//! Host primitives for the hosting panel: command execution, file layout,
//! validation, and one manager per external subsystem.

pub mod database;
pub mod dns;
pub mod exec;
pub mod fs;
pub mod install;
pub mod mail;
pub mod php;
pub mod security;
pub mod service;
pub mod ssl;
pub mod system;
pub mod web;
