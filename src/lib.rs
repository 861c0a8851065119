//! HTML-to-JPEG rendering through a recycled headless browser.

pub mod application;
pub mod config;
pub mod infra;
