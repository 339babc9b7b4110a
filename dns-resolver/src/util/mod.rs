pub mod hostname;
pub mod nameserver;
pub mod net;
