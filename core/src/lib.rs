pub mod headers;
pub mod messages;
pub mod profiles;

pub type Result<T> = anyhow::Result<T>;
