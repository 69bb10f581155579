pub mod local;

pub use local::{bind, display_urls, get_local_ip};
