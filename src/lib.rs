// Noble Clarity Engine - financial coaching backend
// Library exports

pub mod audit;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod mail;
pub mod providers;
pub mod server;
pub mod store;
pub mod stream;
