pub mod db_connect;
pub mod env;
pub mod error_log;
pub mod progress_config;
