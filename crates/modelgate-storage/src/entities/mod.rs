pub mod access_tokens;
pub mod accounts;
pub mod providers;
pub mod request_logs;
pub mod users;
