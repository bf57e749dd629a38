mod proxy;

pub use proxy::{FwliteConfig, ProxySection, RulesSection};
