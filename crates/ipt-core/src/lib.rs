pub mod chain;
pub mod config;
pub mod conntrack;
pub mod error;
pub mod packet;
pub mod parser;
pub mod rule;
pub mod table;

pub use chain::*;
pub use config::*;
pub use conntrack::*;
pub use error::*;
pub use packet::*;
pub use parser::*;
pub use rule::*;
pub use table::*;

// iptables-style rule engine: rule files in, per-packet verdicts out
