pub mod defer;
pub mod rate_limit;
