// Remote boundary: catalog/transfer backend trait, HTTP implementation and credential handling.

pub mod auth;
pub mod http_source;
pub mod traits;
